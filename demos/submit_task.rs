//! Submit a task and poll it until it finishes.
//!
//! ```text
//! cargo run --example submit_task -- --addr http://127.0.0.1:50051 --cmd "echo hi"
//! ```

use std::time::Duration;

use clap::Parser;
use dispatch_lite::proto::dispatch_service_client::DispatchServiceClient;
use dispatch_lite::proto::{
    GetTaskStatusRequest, ResourceAmount, ResourceKind, SubmitTaskRequest, TaskState,
};

#[derive(Parser, Debug)]
#[command(name = "submit-task")]
#[command(about = "Submit one task to a dispatch-lite leader and wait for it")]
struct Args {
    /// Leader address
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// The command to execute
    #[arg(short, long)]
    cmd: String,

    /// Millicores to request
    #[arg(long, default_value = "100")]
    cpu: u64,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut client = DispatchServiceClient::connect(args.addr.clone()).await?;

    let submitted = client
        .submit_task(SubmitTaskRequest {
            command: args.cmd.clone(),
            resources: vec![ResourceAmount {
                kind: ResourceKind::Cpu as i32,
                amount: args.cpu,
            }],
            max_retries: 0,
        })
        .await?
        .into_inner();
    println!("Task ID: {}", submitted.task_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait_secs);
    let mut last_state = TaskState::Unspecified;
    while tokio::time::Instant::now() < deadline {
        let task = client
            .get_task_status(GetTaskStatusRequest {
                task_id: submitted.task_id.clone(),
            })
            .await?
            .into_inner()
            .task
            .ok_or("empty response")?;

        let state = TaskState::try_from(task.state).unwrap_or(TaskState::Unspecified);
        if state != last_state {
            println!("State: {:?} (worker {}, epoch {})", state, task.assigned_worker, task.epoch);
            last_state = state;
        }
        if matches!(
            state,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        ) {
            if !task.error.is_empty() {
                println!("Error: {}", task.error);
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    Err("timed out waiting for the task to finish".into())
}
