use std::time::Duration;

use dispatch_lite::worker::TaskExecutor;
use uuid::Uuid;

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = TaskExecutor::new();
    let task_id = Uuid::new_v4();

    let result = executor.execute(task_id, 4, "echo hello").await;

    assert_eq!(result.task_id, task_id);
    assert_eq!(result.epoch, 4);
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, Some("hello\n".to_string()));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_empty_output() {
    let executor = TaskExecutor::new();

    let result = executor.execute(Uuid::new_v4(), 1, "true").await;

    assert!(result.success);
    assert!(result.output.is_none()); // Empty output should be None
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = TaskExecutor::new();

    let result = executor.execute(Uuid::new_v4(), 1, "seq 1 1000").await;

    assert!(result.success);
    let output = result.output.unwrap();
    assert_eq!(output.lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let executor = TaskExecutor::new();

    let result = executor.execute(Uuid::new_v4(), 1, "exit 1").await;

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.error.as_deref(), Some("Exit code: Some(1)"));
}

#[tokio::test]
async fn test_execute_reports_exit_code() {
    let executor = TaskExecutor::new();

    let result = executor.execute(Uuid::new_v4(), 1, "exit 3").await;

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let executor = TaskExecutor::new();

    let result = executor
        .execute(Uuid::new_v4(), 1, "echo 'error message' >&2 && exit 1")
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("error message"));
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let executor = TaskExecutor::new();

    let result = executor
        .execute(Uuid::new_v4(), 1, "nonexistent_command_12345")
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(127));
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_execute_piped_commands() {
    let executor = TaskExecutor::new();

    let result = executor
        .execute(Uuid::new_v4(), 1, "echo 'hello world' | wc -w")
        .await;

    assert!(result.success);
    // Output should be "2" (word count)
    assert_eq!(result.output.unwrap().trim(), "2");
}

#[tokio::test]
async fn test_execute_with_special_characters() {
    let executor = TaskExecutor::new();

    // Single quotes prevent variable expansion
    let result = executor
        .execute(Uuid::new_v4(), 1, "echo 'hello $USER'")
        .await;

    assert_eq!(result.output, Some("hello $USER\n".to_string()));
}

#[tokio::test]
async fn test_dropping_execution_stops_the_command() {
    let executor = TaskExecutor::new();
    let task_id = Uuid::new_v4();

    let handle = tokio::spawn(async move { executor.execute(task_id, 1, "sleep 30").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    let err = handle.await.unwrap_err();
    assert!(err.is_cancelled());
}
