//! Task table, placement and the scheduling loop.

pub mod engine;
pub mod placement;
pub mod resources;
pub mod state;
pub mod task;
pub mod tracker;

pub use engine::{
    event_channel, Assignment, HeartbeatReply, HeartbeatReport, Scheduler, SchedulerEvent,
    SchedulerHandle, StateSummary, SubmitReceipt, TaskReport, WorkerStatus,
};
pub use resources::{ResourceKind, Resources};
pub use state::ClusterState;
pub use task::{
    AssignmentRecord, Epoch, FailureReason, Task, TaskEvent, TaskId, TaskSpec, TaskState,
    Transition, WorkerId,
};
pub use tracker::HeartbeatTracker;
