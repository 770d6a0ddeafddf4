use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing_subscriber::EnvFilter;

use dispatch_lite::config::{parse_peers, NodeConfig, SchedulerConfig, WorkerConfig};
use dispatch_lite::grpc::convert::{resources_to_proto, task_state_from_proto};
use dispatch_lite::node::Node;
use dispatch_lite::proto::dispatch_service_client::DispatchServiceClient;
use dispatch_lite::proto::{
    CancelTaskRequest, GetClusterStatusRequest, GetTaskStatusRequest, GetWorkerStatusRequest,
    ListTasksRequest, SubmitTaskRequest, TaskInfo, TaskState,
};
use dispatch_lite::scheduler::Resources;
use dispatch_lite::shutdown::install_shutdown_handler;
use dispatch_lite::worker::WorkerAgent;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "A Raft-replicated control plane for dispatching batch tasks")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a control-plane replica
    Server(ServerArgs),

    /// Start a worker agent
    Worker(WorkerArgs),

    /// Task management commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Cluster inspection commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server / Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this replica)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Silence (ms) after which a worker is considered dead
    #[arg(long, default_value = "5000")]
    liveness_timeout_ms: u64,

    /// Default retry bound for submitted tasks
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Pending tasks at which submissions are rejected
    #[arg(long, default_value = "10000")]
    max_pending_tasks: usize,

    /// How long (ms) a log write may wait for a quorum
    #[arg(long, default_value = "5000")]
    quorum_timeout_ms: u64,

    /// How long (ms) finished tasks stay queryable
    #[arg(long, default_value = "600000")]
    retention_ms: u64,

    /// How long (ms) an unconfirmed cancel may stay outstanding
    #[arg(long, default_value = "30000")]
    cancel_timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Worker ID (unique across the cluster)
    #[arg(long)]
    worker_id: u64,

    /// Control-plane addresses; the agent rotates through them to find the leader
    #[arg(long, short = 'a', value_delimiter = ',', default_value = "http://127.0.0.1:50051")]
    servers: Vec<String>,

    /// Advertised capacity, e.g. "cpu=4000,memory=8192,gpu=1"
    #[arg(long, default_value = "cpu=1000,memory=1024")]
    capacity: Resources,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by task and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server addresses; writes are retried on the next one when a replica
    /// is not the leader
    #[arg(long, short = 'a', value_delimiter = ',', default_value = "http://127.0.0.1:50051")]
    addr: Vec<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Submit a new task
    Submit {
        /// The command to execute (e.g., "echo hello")
        command: String,

        /// Requested resources, e.g. "cpu=500,memory=256"
        #[arg(long, short = 'r', default_value = "")]
        resources: Resources,

        /// Retry bound (0 uses the cluster default)
        #[arg(long, default_value = "0")]
        max_retries: u32,
    },
    /// Get status of a specific task
    Status {
        /// The task ID (UUID)
        task_id: String,
    },
    /// Request cancellation of a task
    Cancel {
        /// The task ID (UUID)
        task_id: String,
    },
    /// List all tasks
    List,
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Replica role, log progress, live workers and task counts
    Status,
    /// Liveness and load of one worker
    Worker {
        worker_id: u64,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    task_id: String,
    epoch: u64,
}

#[derive(Serialize)]
struct TaskOutput {
    task_id: String,
    state: String,
    command: String,
    assigned_worker: u64,
    epoch: u64,
    retry_count: u32,
    max_retries: u32,
    error: String,
    cancel_requested: bool,
    submitted_at_ms: i64,
    finished_at_ms: Option<i64>,
}

impl From<TaskInfo> for TaskOutput {
    fn from(task: TaskInfo) -> Self {
        Self {
            state: state_name(task.state),
            task_id: task.task_id,
            command: task.command,
            assigned_worker: task.assigned_worker,
            epoch: task.epoch,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            error: task.error,
            cancel_requested: task.cancel_requested,
            submitted_at_ms: task.submitted_at_ms,
            finished_at_ms: task.finished_at_ms,
        }
    }
}

#[derive(Serialize)]
struct CancelOutput {
    state: String,
    cancel_requested: bool,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    node_id: u64,
    role: String,
    current_term: u64,
    leader_id: u64,
    commit_index: u64,
    last_applied: u64,
    live_workers: Vec<u64>,
    task_counts: Vec<(String, u64)>,
}

#[derive(Serialize)]
struct WorkerOutput {
    worker_id: u64,
    capacity: String,
    spare: String,
    task_ids: Vec<String>,
    last_heartbeat_age_ms: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn state_name(state: i32) -> String {
    TaskState::try_from(state)
        .ok()
        .and_then(task_state_from_proto)
        .map(|s| s.to_string().to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run `call` against each address in turn until one replica answers with
/// something other than "not the leader" or "unavailable".
async fn with_leader<T, F, Fut>(addrs: &[String], call: F) -> Result<T, Box<dyn std::error::Error>>
where
    F: Fn(DispatchServiceClient<Channel>) -> Fut,
    Fut: std::future::Future<Output = Result<T, Status>>,
{
    let mut last_error: Option<Box<dyn std::error::Error>> = None;

    for addr in addrs {
        let client = match DispatchServiceClient::connect(addr.clone()).await {
            Ok(client) => client,
            Err(e) => {
                last_error = Some(format!("{}: {}", addr, e).into());
                continue;
            }
        };
        match call(client).await {
            Ok(value) => return Ok(value),
            Err(status)
                if matches!(status.code(), Code::FailedPrecondition | Code::Unavailable) =>
            {
                eprintln!("{}: {}", addr, status.message());
                last_error = Some(status.message().to_string().into());
            }
            Err(status) => return Err(format!("{:?}: {}", status.code(), status.message()).into()),
        }
    }

    Err(last_error.unwrap_or_else(|| "no server address given".into()))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server / Worker Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let peers = parse_peers(&args.peers)?;

    let scheduler = SchedulerConfig {
        liveness_timeout_ms: args.liveness_timeout_ms,
        max_retries: args.max_retries,
        max_pending_tasks: args.max_pending_tasks,
        quorum_timeout_ms: args.quorum_timeout_ms,
        retention_ms: args.retention_ms,
        cancel_timeout_ms: args.cancel_timeout_ms,
        ..SchedulerConfig::default()
    };
    let config = NodeConfig {
        peers,
        ..NodeConfig::new(args.node_id, listen_addr).with_scheduler(scheduler)
    };

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        peers = ?config
            .peers
            .iter()
            .map(|p| format!("{}:{}", p.node_id, p.addr))
            .collect::<Vec<_>>(),
        "Starting dispatch-lite replica"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config).run(shutdown).await
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = WorkerConfig::new(args.worker_id, args.servers, args.capacity);
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;

    let shutdown = install_shutdown_handler();
    WorkerAgent::new(config).run(shutdown).await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_task(
    command: TaskCommands,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        TaskCommands::Submit {
            command,
            resources,
            max_retries,
        } => {
            let request = SubmitTaskRequest {
                command,
                resources: resources_to_proto(&resources),
                max_retries,
            };
            let resp = with_leader(&client.addr, |mut c| {
                let request = request.clone();
                async move { c.submit_task(request).await.map(|r| r.into_inner()) }
            })
            .await?;

            match client.output {
                OutputFormat::Json => print_json(&SubmitOutput {
                    task_id: resp.task_id,
                    epoch: resp.epoch,
                })?,
                OutputFormat::Table => {
                    println!("Task submitted successfully!");
                    println!("Task ID: {}", resp.task_id);
                }
            }
        }
        TaskCommands::Status { task_id } => {
            let resp = with_leader(&client.addr, |mut c| {
                let task_id = task_id.clone();
                async move {
                    c.get_task_status(GetTaskStatusRequest { task_id })
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
            let task = resp.task.ok_or("empty response")?;

            match client.output {
                OutputFormat::Json => print_json(&TaskOutput::from(task))?,
                OutputFormat::Table => {
                    println!("Task ID:         {}", task.task_id);
                    println!("State:           {}", state_name(task.state));
                    println!("Command:         {}", task.command);
                    if task.assigned_worker > 0 {
                        println!("Assigned Worker: {}", task.assigned_worker);
                        println!("Epoch:           {}", task.epoch);
                    }
                    println!("Retries:         {}/{}", task.retry_count, task.max_retries);
                    if task.cancel_requested {
                        println!("Cancel:          requested");
                    }
                    if !task.error.is_empty() {
                        println!("Error:");
                        for line in task.error.lines() {
                            println!("  {}", line);
                        }
                    }
                }
            }
        }
        TaskCommands::Cancel { task_id } => {
            let resp = with_leader(&client.addr, |mut c| {
                let task_id = task_id.clone();
                async move {
                    c.cancel_task(CancelTaskRequest { task_id })
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;

            match client.output {
                OutputFormat::Json => print_json(&CancelOutput {
                    state: state_name(resp.state),
                    cancel_requested: resp.cancel_requested,
                })?,
                OutputFormat::Table => {
                    println!("State: {}", state_name(resp.state));
                    if resp.cancel_requested && resp.state != TaskState::Cancelled as i32 {
                        println!("Cancel requested; waiting for the worker to confirm");
                    }
                }
            }
        }
        TaskCommands::List => {
            let resp = with_leader(&client.addr, |mut c| async move {
                c.list_tasks(ListTasksRequest {}).await.map(|r| r.into_inner())
            })
            .await?;

            match client.output {
                OutputFormat::Json => {
                    let tasks: Vec<TaskOutput> =
                        resp.tasks.into_iter().map(TaskOutput::from).collect();
                    print_json(&tasks)?;
                }
                OutputFormat::Table => {
                    if resp.tasks.is_empty() {
                        println!("No tasks found.");
                        return Ok(());
                    }
                    println!(
                        "{:<38} {:<10} {:<8} {:<8} COMMAND",
                        "TASK ID", "STATE", "WORKER", "RETRIES"
                    );
                    println!("{}", "-".repeat(86));
                    for task in &resp.tasks {
                        let worker = if task.assigned_worker > 0 {
                            task.assigned_worker.to_string()
                        } else {
                            "-".to_string()
                        };
                        let cmd_display = if task.command.chars().count() > 20 {
                            format!("{}...", task.command.chars().take(17).collect::<String>())
                        } else {
                            task.command.clone()
                        };
                        println!(
                            "{:<38} {:<10} {:<8} {:<8} {}",
                            task.task_id,
                            state_name(task.state),
                            worker,
                            format!("{}/{}", task.retry_count, task.max_retries),
                            cmd_display
                        );
                    }
                    println!();
                    println!("{} tasks", resp.tasks.len());
                }
            }
        }
    }
    Ok(())
}

async fn handle_cluster(
    command: ClusterCommands,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ClusterCommands::Status => {
            let resp = with_leader(&client.addr, |mut c| async move {
                c.get_cluster_status(GetClusterStatusRequest {})
                    .await
                    .map(|r| r.into_inner())
            })
            .await?;
            let counts: Vec<(String, u64)> = resp
                .task_counts
                .iter()
                .map(|c| (state_name(c.state), c.count))
                .collect();

            match client.output {
                OutputFormat::Json => print_json(&ClusterStatusOutput {
                    node_id: resp.node_id,
                    role: resp.role,
                    current_term: resp.current_term,
                    leader_id: resp.leader_id,
                    commit_index: resp.commit_index,
                    last_applied: resp.last_applied,
                    live_workers: resp.live_workers,
                    task_counts: counts,
                })?,
                OutputFormat::Table => {
                    println!("Cluster Status");
                    println!("{}", "=".repeat(40));
                    println!("Node:         {} ({})", resp.node_id, resp.role);
                    println!("Term:         {}", resp.current_term);
                    println!("Leader:       Node {}", resp.leader_id);
                    println!("Commit index: {}", resp.commit_index);
                    println!("Applied:      {}", resp.last_applied);
                    println!("Live workers: {:?}", resp.live_workers);
                    println!();
                    println!("{:<12} COUNT", "STATE");
                    println!("{}", "-".repeat(20));
                    for (state, count) in counts {
                        println!("{:<12} {}", state, count);
                    }
                }
            }
        }
        ClusterCommands::Worker { worker_id } => {
            let resp = with_leader(&client.addr, |mut c| async move {
                c.get_worker_status(GetWorkerStatusRequest { worker_id })
                    .await
                    .map(|r| r.into_inner())
            })
            .await?;
            let capacity = dispatch_lite::grpc::convert::resources_from_proto(&resp.capacity)?;
            let spare = dispatch_lite::grpc::convert::resources_from_proto(&resp.spare)?;

            match client.output {
                OutputFormat::Json => print_json(&WorkerOutput {
                    worker_id: resp.worker_id,
                    capacity: capacity.to_string(),
                    spare: spare.to_string(),
                    task_ids: resp.task_ids,
                    last_heartbeat_age_ms: resp.last_heartbeat_age_ms,
                })?,
                OutputFormat::Table => {
                    println!("Worker:         {}", resp.worker_id);
                    println!("Capacity:       {}", capacity);
                    println!("Spare:          {}", spare);
                    println!("Last heartbeat: {}ms ago", resp.last_heartbeat_age_ms);
                    println!("Tasks:");
                    for id in resp.task_ids {
                        println!("  {}", id);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Task { client, command } => handle_task(command, &client).await?,
        Commands::Cluster { client, command } => handle_cluster(command, &client).await?,
    }

    Ok(())
}
