//! Event sink trait and implementations.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// Receiver for pipeline lifecycle events.
///
/// Sinks are fire-and-forget from the pipeline's point of view: a sink
/// failure never changes a task's outcome.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Dotted event name, e.g. `task.received`
    /// * `data` - Optional structured payload
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without awaiting. Must not panic.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events through `tracing`.
///
/// Failure events (`task.fatal`, `task.malformed`, `task.dead_lettered`,
/// `stage.failed`, `handoff.failed`) are always logged at WARN regardless of
/// the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        if super::is_failure(event_type) {
            warn!(event_type, event_data = ?data, "Event: {}", event_type);
            return;
        }
        if self.level == Level::DEBUG || self.level == Level::TRACE {
            debug!(event_type, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type, event_data = ?data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Records every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Recorded event types in emission order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Number of events of exactly `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .count()
    }

    /// Events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets all recorded events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::names;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(names::TASK_RECEIVED, None).await;
        let sink = LoggingEventSink::debug();
        sink.emit(names::TASK_FATAL, Some(serde_json::json!({"reason": "x"})))
            .await;
        sink.try_emit(names::SENTINEL_POSTED, None);
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(names::STAGE_COMPLETED, None).await;
        sink.emit(names::STAGE_FAILED, None).await;
        sink.try_emit(names::TASK_RETRY, Some(serde_json::json!({"attempt": 2})));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.count(names::TASK_RETRY), 1);
        assert_eq!(sink.types()[0], "stage.completed");

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_collecting_sink_from_sync_code() {
        let sink = CollectingEventSink::new();
        sink.try_emit(names::TASK_RECEIVED, None);
        tokio_test::block_on(sink.emit(names::TASK_SUCCEEDED, None));
        assert_eq!(sink.types(), vec!["task.received", "task.succeeded"]);
    }
}
