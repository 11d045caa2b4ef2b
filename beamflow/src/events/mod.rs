//! Lifecycle events.
//!
//! Components report what happened to a task through an [`EventSink`]. The
//! event names are fixed and listed in [`names`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A delivery was turned into a task and handed to the handler.
    pub const TASK_RECEIVED: &str = "task.received";
    /// The handler returned success; the delivery was acked.
    pub const TASK_SUCCEEDED: &str = "task.succeeded";
    /// The handler asked for a retry; the delivery was nacked.
    pub const TASK_RETRY: &str = "task.retry";
    /// The handler failed permanently; the delivery was acked.
    pub const TASK_FATAL: &str = "task.fatal";
    /// The delivery body was not a valid task message.
    pub const TASK_MALFORMED: &str = "task.malformed";
    /// The delivery exceeded the redelivery limit.
    pub const TASK_DEAD_LETTERED: &str = "task.dead_lettered";
    /// The delivery was deferred behind an in-flight task with the same key.
    pub const TASK_DEFERRED: &str = "task.deferred";
    /// A stage exited successfully with all declared outputs.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A handoff sentinel was posted.
    pub const SENTINEL_POSTED: &str = "sentinel.posted";
    /// A handoff sentinel was taken by a watcher.
    pub const SENTINEL_TAKEN: &str = "sentinel.taken";
    /// An output artifact was uploaded.
    pub const ARTIFACT_UPLOADED: &str = "artifact.uploaded";
    /// A watcher could not finish a handoff.
    pub const HANDOFF_FAILED: &str = "handoff.failed";
    /// A watcher claim outlived its visibility timeout and was put back.
    pub const HANDOFF_RECOVERED: &str = "handoff.recovered";
    /// The task's source object is outside the accepted set; the delivery was acked.
    pub const TASK_FILTERED: &str = "task.filtered";
}

pub(crate) fn is_failure(event_type: &str) -> bool {
    matches!(
        event_type,
        names::TASK_FATAL
            | names::TASK_MALFORMED
            | names::TASK_DEAD_LETTERED
            | names::STAGE_FAILED
            | names::HANDOFF_FAILED
    )
}
