use std::process::Stdio;
use tokio::process::Command;

use crate::scheduler::{Epoch, TaskId};

/// Outcome of one task run
#[derive(Debug)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub epoch: Epoch,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Runs task commands through `sh -c` on the local host.
///
/// The child is killed when the future running it is dropped, so aborting a
/// task also stops its process.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, task_id: TaskId, epoch: Epoch, command: &str) -> ExecutionResult {
        tracing::info!(task_id = %task_id, epoch, command, "Executing task");

        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        Self::process_output(task_id, epoch, result)
    }

    fn process_output(
        task_id: TaskId,
        epoch: Epoch,
        result: Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let exit_code = output.status.code();
                let success = output.status.success();

                let error = (!success).then(|| {
                    if stderr.is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr
                    }
                });

                tracing::info!(
                    task_id = %task_id,
                    epoch,
                    success,
                    exit_code = ?exit_code,
                    "Task finished"
                );

                ExecutionResult {
                    task_id,
                    epoch,
                    success,
                    exit_code,
                    output: (!stdout.is_empty()).then_some(stdout),
                    error,
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, epoch, error = %e, "Task could not be started");
                ExecutionResult {
                    task_id,
                    epoch,
                    success: false,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
