//! Failover tests for leader failure and recovery.
//!
//! These tests verify that a new leader is elected and that it continues
//! from the committed assignment log instead of starting over.


use std::time::Duration;

use dispatch_lite::error::DispatchError;
use dispatch_lite::proto::SubmitTaskRequest;
use dispatch_lite::scheduler::{HeartbeatReport, ResourceKind, Resources, TaskSpec, TaskState};
use test_harness::{assert_eventually, TestCluster};

fn cpu(millis: u64) -> Resources {
    Resources::new().with(ResourceKind::Cpu, millis)
}

#[tokio::test]
async fn test_exactly_one_leader_is_elected() {
    let cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    // Give a competing election time to show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.count_leaders().await, 1, "Exactly one leader should exist");
}

#[tokio::test]
async fn test_submitted_task_replicates_to_followers() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.leader().await;

    let receipt = leader
        .scheduler
        .submit(TaskSpec::new("echo replicated"))
        .await
        .expect("Leader should accept the task");

    assert!(
        cluster
            .wait_for_commit_on_all(receipt.epoch, Duration::from_secs(3))
            .await,
        "Every node should commit the submission"
    );

    let follower = cluster.follower().await;
    let task = follower
        .scheduler
        .task_status(receipt.task_id)
        .await
        .expect("Follower should answer from its applied state");
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.spec.command, "echo replicated");
}

#[tokio::test]
async fn test_follower_rejects_writes() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster.leader().await.node_id;
    let follower = cluster.follower().await;

    // Wait until the follower has heard from the leader
    assert_eventually(
        || async { follower.raft_node.get_leader_id().await == Some(leader_id) },
        Duration::from_secs(3),
        "Follower should learn the leader",
    )
    .await;

    let err = follower
        .scheduler
        .submit(TaskSpec::new("true"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotLeader(Some(id)) if id == leader_id));

    let err = follower
        .scheduler
        .heartbeat(HeartbeatReport::new(1, cpu(1000)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotLeader(_)));

    let mut client = follower.client().await;
    let status = client
        .submit_task(SubmitTaskRequest {
            command: "true".to_string(),
            resources: vec![],
            max_retries: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert!(status.message().contains(&format!("node {}", leader_id)));
}

#[tokio::test]
async fn test_new_leader_keeps_committed_assignments() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.leader().await;
    let old_leader_id = leader.node_id;
    let old_term = leader.current_term().await;

    let receipt = leader
        .scheduler
        .submit(TaskSpec::new("sleep 30").with_resources(cpu(100)))
        .await
        .unwrap();
    let reply = leader
        .scheduler
        .heartbeat(HeartbeatReport::new(1, cpu(1000)))
        .await
        .unwrap();
    assert_eq!(reply.assignments.len(), 1);
    let epoch = reply.assignments[0].epoch;

    assert!(
        cluster
            .wait_for_commit_on_all(epoch, Duration::from_secs(3))
            .await,
        "Assignment should reach every node"
    );

    cluster.shutdown_node(old_leader_id);
    let new_leader_id = cluster
        .wait_for_new_leader(old_leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");
    let new_leader = cluster.get_node(new_leader_id).unwrap();
    assert!(new_leader.current_term().await > old_term);

    let task = new_leader.scheduler.task_status(receipt.task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Assigned);
    assert_eq!(task.assigned_worker, Some(1));
    assert_eq!(task.epoch, epoch);

    // The worker reconnects and is handed the same assignment, not a new one
    let reply = new_leader
        .scheduler
        .heartbeat(HeartbeatReport::new(1, cpu(1000)))
        .await
        .unwrap();
    assert_eq!(reply.assignments.len(), 1);
    assert_eq!(reply.assignments[0].task_id, receipt.task_id);
    assert_eq!(reply.assignments[0].epoch, epoch);
    assert_eq!(reply.leader_id, Some(new_leader_id));
}

#[tokio::test]
async fn test_silent_worker_is_expired_after_failover() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.leader().await;
    let old_leader_id = leader.node_id;

    let receipt = leader
        .scheduler
        .submit(TaskSpec::new("sleep 30").with_resources(cpu(100)))
        .await
        .unwrap();
    let reply = leader
        .scheduler
        .heartbeat(HeartbeatReport::new(1, cpu(1000)))
        .await
        .unwrap();
    let first_epoch = reply.assignments[0].epoch;
    assert!(
        cluster
            .wait_for_commit_on_all(first_epoch, Duration::from_secs(3))
            .await
    );

    cluster.shutdown_node(old_leader_id);
    let new_leader_id = cluster
        .wait_for_new_leader(old_leader_id, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");
    let new_leader = cluster.get_node(new_leader_id).unwrap();

    // Worker 1 never checks in with the new leader
    assert_eventually(
        || async {
            new_leader
                .scheduler
                .task_status(receipt.task_id)
                .await
                .is_ok_and(|t| t.state == TaskState::Pending && t.retry_count == 1)
        },
        Duration::from_secs(5),
        "Task held by a silent worker should be re-queued",
    )
    .await;

    let task = new_leader.scheduler.task_status(receipt.task_id).await.unwrap();
    assert_eq!(task.last_error.as_deref(), Some("worker lost"));

    let reply = new_leader
        .scheduler
        .heartbeat(HeartbeatReport::new(2, cpu(1000)))
        .await
        .unwrap();
    assert_eq!(reply.assignments.len(), 1);
    assert!(reply.assignments[0].epoch > first_epoch);
}

#[tokio::test]
async fn test_multiple_sequential_leader_failures() {
    let mut cluster = TestCluster::new(5).await;

    let mut submitted = Vec::new();
    for round in 0..2 {
        let leader = cluster.leader().await;
        let leader_id = leader.node_id;
        let receipt = leader
            .scheduler
            .submit(TaskSpec::new(format!("echo round_{}", round)))
            .await
            .unwrap();
        submitted.push(receipt.task_id);
        assert!(
            cluster
                .wait_for_commit_on_all(receipt.epoch, Duration::from_secs(3))
                .await
        );

        cluster.shutdown_node(leader_id);
        cluster
            .wait_for_new_leader(leader_id, Duration::from_secs(5))
            .await
            .expect("Remaining nodes should elect a leader");
    }

    // Three of five nodes remain, still a quorum
    let leader = cluster.leader().await;
    leader
        .scheduler
        .submit(TaskSpec::new("echo after"))
        .await
        .expect("Quorum of survivors should accept writes");

    let tasks = leader.scheduler.list_tasks().await.unwrap();
    for id in submitted {
        assert!(tasks.iter().any(|t| t.id == id), "Task {} should survive", id);
    }
}
