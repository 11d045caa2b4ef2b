//! Queue consumer.
//!
//! Pulls deliveries, turns them into [`Task`]s, runs the handler and maps its
//! [`Outcome`] onto ack/nack. Malformed and dead-lettered messages are acked
//! without reaching the handler so that a poison message cannot loop. Tasks
//! whose source object fails the [`SourceFilter`] are acked as filtered.

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{Delivery, MessageQueue};
use crate::core::{Outcome, SourceFilter, Task};
use crate::errors::QueueError;
use crate::events::{names, EventSink, NoOpEventSink};

/// Processes one task. Implemented by the pipeline coordinator.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task and reports how the delivery should be settled.
    async fn handle(&self, task: &Task) -> Outcome;
}

/// Consumer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Upper bound on concurrently running handlers.
    pub max_in_flight: usize,
    /// Deliveries beyond this attempt are dead-lettered.
    pub max_deliveries: u32,
    /// Sleep between receives when the queue is empty.
    pub receive_poll: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            max_deliveries: 5,
            receive_poll: Duration::from_millis(500),
        }
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Handler succeeded; acked.
    Succeeded,
    /// Handler asked for a retry; nacked.
    Retried,
    /// Handler failed permanently; acked.
    Fatal,
    /// Body was not a valid task; acked.
    Malformed,
    /// Too many deliveries; acked.
    DeadLettered,
    /// Same key already in flight; nacked.
    Deferred,
    /// Source object is not a pipeline input; acked.
    Filtered,
}

/// Counts of settled deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    /// Deliveries settled as [`Disposition::Succeeded`].
    pub succeeded: u64,
    /// Deliveries settled as [`Disposition::Retried`].
    pub retried: u64,
    /// Deliveries settled as [`Disposition::Fatal`].
    pub fatal: u64,
    /// Deliveries settled as [`Disposition::Malformed`].
    pub malformed: u64,
    /// Deliveries settled as [`Disposition::DeadLettered`].
    pub dead_lettered: u64,
    /// Deliveries settled as [`Disposition::Deferred`].
    pub deferred: u64,
    /// Deliveries settled as [`Disposition::Filtered`].
    pub filtered: u64,
}

impl ConsumerStats {
    /// Total settled deliveries.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.succeeded
            + self.retried
            + self.fatal
            + self.malformed
            + self.dead_lettered
            + self.deferred
            + self.filtered
    }
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    retried: AtomicU64,
    fatal: AtomicU64,
    malformed: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    filtered: AtomicU64,
}

impl Counters {
    fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Succeeded => &self.succeeded,
            Disposition::Retried => &self.retried,
            Disposition::Fatal => &self.fatal,
            Disposition::Malformed => &self.malformed,
            Disposition::DeadLettered => &self.dead_lettered,
            Disposition::Deferred => &self.deferred,
            Disposition::Filtered => &self.filtered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
        }
    }
}

/// Holds a task key in the in-flight set until dropped.
struct KeyGuard {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl KeyGuard {
    fn acquire(keys: &Arc<DashSet<String>>, key: &str) -> Option<Self> {
        keys.insert(key.to_string()).then(|| Self {
            keys: keys.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

/// Drives a [`MessageQueue`] with a [`TaskHandler`].
#[derive(Clone)]
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    config: ConsumerConfig,
    filter: SourceFilter,
    events: Arc<dyn EventSink>,
    in_flight: Arc<DashSet<String>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("config", &self.config)
            .field("filter", &self.filter)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    /// Creates a consumer over `queue` that accepts every task.
    #[must_use]
    pub fn new(queue: Arc<dyn MessageQueue>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            config,
            filter: SourceFilter::accept_all(),
            events: Arc::new(NoOpEventSink),
            in_flight: Arc::new(DashSet::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Sets the accept filter applied before the handler.
    #[must_use]
    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Counts of deliveries settled so far.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Receives and processes deliveries until `shutdown` is cancelled.
    ///
    /// On shutdown no new delivery is received; handlers already running are
    /// awaited before this returns.
    pub async fn consume(&self, handler: Arc<dyn TaskHandler>, shutdown: CancellationToken) -> ConsumerStats {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut running = JoinSet::new();

        info!(
            max_in_flight = self.config.max_in_flight,
            max_deliveries = self.config.max_deliveries,
            "Queue consumer started"
        );

        loop {
            while let Some(joined) = running.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.receive().await {
                Ok(Some(delivery)) => {
                    let this = self.clone();
                    let handler = handler.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        this.process(handler.as_ref(), delivery).await
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if !idle(&shutdown, self.config.receive_poll).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Queue receive failed");
                    if !idle(&shutdown, self.config.receive_poll).await {
                        break;
                    }
                }
            }
        }

        info!(in_flight = running.len(), "Queue consumer stopping, draining in-flight tasks");
        while let Some(joined) = running.join_next().await {
            log_join(joined);
        }

        let stats = self.stats();
        info!(settled = stats.total(), "Queue consumer stopped");
        stats
    }

    /// Processes one delivery and settles it with the queue.
    pub async fn process(&self, handler: &dyn TaskHandler, delivery: Delivery) -> Disposition {
        let Delivery { token, body, attempt } = delivery;

        let disposition = if attempt > self.config.max_deliveries {
            self.dead_letter(&token, &body, attempt).await
        } else {
            match Task::from_delivery(&token, &body, attempt) {
                Ok(task) => match self.filter.rejection(&task) {
                    Some(reason) => self.drop_filtered(&task, &reason).await,
                    None => {
                        let span = info_span!("task", task = task.key(), attempt);
                        self.dispatch(handler, task).instrument(span).await
                    }
                },
                Err(err) => self.drop_malformed(&token, &err).await,
            }
        };

        self.counters.record(disposition);
        disposition
    }

    async fn dispatch(&self, handler: &dyn TaskHandler, task: Task) -> Disposition {
        let Some(_guard) = KeyGuard::acquire(&self.in_flight, task.key()) else {
            info!("Task with the same key already in flight, deferring");
            self.events
                .emit(
                    names::TASK_DEFERRED,
                    Some(serde_json::json!({ "task": task.key(), "attempt": task.delivery_attempt })),
                )
                .await;
            self.settle(&task.id, false).await;
            return Disposition::Deferred;
        };

        self.events
            .emit(
                names::TASK_RECEIVED,
                Some(serde_json::json!({
                    "task": task.key(),
                    "source": task.source_blob_ref.to_string(),
                    "attempt": task.delivery_attempt,
                })),
            )
            .await;

        let outcome = handler.handle(&task).await;
        let data = serde_json::json!({
            "task": task.key(),
            "source": task.source_blob_ref.to_string(),
            "attempt": task.delivery_attempt,
            "reason": outcome.reason(),
        });

        match &outcome {
            Outcome::Success => {
                self.settle(&task.id, true).await;
                info!("Task succeeded");
                self.events.emit(names::TASK_SUCCEEDED, Some(data)).await;
                Disposition::Succeeded
            }
            Outcome::RetryableFailure(reason) => {
                warn!(reason = %reason, "Task failed, requesting redelivery");
                self.settle(&task.id, false).await;
                self.events.emit(names::TASK_RETRY, Some(data)).await;
                Disposition::Retried
            }
            Outcome::FatalFailure(reason) => {
                error!(
                    source_blob_ref = %task.source_blob_ref,
                    reason = %reason,
                    "Task failed permanently, dropping"
                );
                self.settle(&task.id, true).await;
                self.events.emit(names::TASK_FATAL, Some(data)).await;
                Disposition::Fatal
            }
        }
    }

    async fn drop_malformed(&self, token: &str, err: &QueueError) -> Disposition {
        error!(token, error = %err, "Malformed delivery, dropping");
        self.settle(token, true).await;
        self.events
            .emit(
                names::TASK_MALFORMED,
                Some(serde_json::json!({ "token": token, "reason": err.to_string() })),
            )
            .await;
        Disposition::Malformed
    }

    async fn drop_filtered(&self, task: &Task, reason: &str) -> Disposition {
        info!(task = task.key(), reason, "Source is not a pipeline input, dropping");
        self.settle(&task.id, true).await;
        self.events
            .emit(
                names::TASK_FILTERED,
                Some(serde_json::json!({
                    "task": task.key(),
                    "source": task.source_blob_ref.to_string(),
                    "reason": reason,
                })),
            )
            .await;
        Disposition::Filtered
    }

    async fn dead_letter(&self, token: &str, body: &[u8], attempt: u32) -> Disposition {
        let source = Task::from_delivery(token, body, attempt)
            .map(|task| task.source_blob_ref.to_string())
            .ok();
        error!(
            token,
            attempt,
            max_deliveries = self.config.max_deliveries,
            source_blob_ref = source.as_deref().unwrap_or("<unparseable>"),
            "Delivery limit exceeded, dead-lettering"
        );
        self.settle(token, true).await;
        self.events
            .emit(
                names::TASK_DEAD_LETTERED,
                Some(serde_json::json!({ "token": token, "attempt": attempt, "source": source })),
            )
            .await;
        Disposition::DeadLettered
    }

    async fn settle(&self, token: &str, ack: bool) {
        let result = if ack {
            self.queue.ack(token).await
        } else {
            self.queue.nack(token).await
        };
        match result {
            Ok(()) => debug!(token, ack, "Delivery settled"),
            // The claim lapses and the queue redelivers; the task is idempotent.
            Err(e) => error!(token, ack, error = %e, "Failed to settle delivery"),
        }
    }
}

/// Sleeps for `poll`. Returns false if shutdown fired first.
async fn idle(shutdown: &CancellationToken, poll: Duration) -> bool {
    tokio::select! {
        biased;

        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(poll) => true,
    }
}

fn log_join(joined: Result<Disposition, tokio::task::JoinError>) {
    match joined {
        Ok(disposition) => debug!(?disposition, "Delivery processed"),
        Err(e) => error!(error = %e, "Task handler panicked or was aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskMessage;
    use crate::events::CollectingEventSink;
    use crate::queue::InMemoryQueue;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct FixedHandler {
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl FixedHandler {
        fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for FixedHandler {
        async fn handle(&self, _task: &Task) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn body(filename: &str) -> Vec<u8> {
        serde_json::to_vec(&TaskMessage::new(
            filename,
            format!("gs://b/fullbodyimages/{filename}"),
        ))
        .unwrap()
    }

    fn consumer(queue: &Arc<InMemoryQueue>) -> (QueueConsumer, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let consumer = QueueConsumer::new(queue.clone(), ConsumerConfig::default())
            .with_event_sink(events.clone());
        (consumer, events)
    }

    #[tokio::test]
    async fn test_success_acks() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, events) = consumer(&queue);
        queue.publish(&body("a.png")).await.unwrap();

        let handler = FixedHandler::new(Outcome::Success);
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(consumer.process(&handler, delivery).await, Disposition::Succeeded);

        assert!(queue.is_drained());
        assert_eq!(queue.counters().acked, 1);
        assert_eq!(events.types(), vec!["task.received", "task.succeeded"]);
    }

    #[tokio::test]
    async fn test_fatal_acks_once_without_redelivery() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, events) = consumer(&queue);
        queue.publish(&body("a.png")).await.unwrap();

        let handler = FixedHandler::new(Outcome::fatal("bad image"));
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(consumer.process(&handler, delivery).await, Disposition::Fatal);

        let counters = queue.counters();
        assert_eq!(counters.acked, 1);
        assert_eq!(counters.nacked, 0);
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(events.count(names::TASK_FATAL), 1);
    }

    #[tokio::test]
    async fn test_retryable_nacks_and_redelivers() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, events) = consumer(&queue);
        queue.publish(&body("a.png")).await.unwrap();

        let handler = FixedHandler::new(Outcome::retryable("render 503"));
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(consumer.process(&handler, delivery).await, Disposition::Retried);
        assert_eq!(queue.counters().nacked, 1);

        let redelivered = queue.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.attempt, 2);
        assert_eq!(events.count(names::TASK_RETRY), 1);
    }

    #[tokio::test]
    async fn test_malformed_is_acked_without_handler() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, events) = consumer(&queue);
        queue.publish(b"{not json").await.unwrap();

        let handler = FixedHandler::new(Outcome::Success);
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(consumer.process(&handler, delivery).await, Disposition::Malformed);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(queue.is_drained());
        assert_eq!(events.count(names::TASK_MALFORMED), 1);
    }

    #[tokio::test]
    async fn test_delivery_limit_dead_letters() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, events) = consumer(&queue);
        queue.publish_redelivered(&body("a.png"), 5);

        let handler = FixedHandler::new(Outcome::Success);
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 6);
        assert_eq!(consumer.process(&handler, delivery).await, Disposition::DeadLettered);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(queue.is_drained());
        let dead = events.events_of_type(names::TASK_DEAD_LETTERED);
        assert_eq!(dead[0].1.as_ref().unwrap()["source"], "gs://b/fullbodyimages/a.png");
    }

    #[tokio::test]
    async fn test_filtered_source_is_acked_without_handler() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, events) = consumer(&queue);
        let consumer = consumer.with_filter(SourceFilter::default());
        queue.publish(&body("a_rgba.png")).await.unwrap();
        queue.publish(&body("b.png")).await.unwrap();

        let handler = FixedHandler::new(Outcome::Success);
        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(consumer.process(&handler, first).await, Disposition::Filtered);
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(consumer.process(&handler, second).await, Disposition::Succeeded);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_drained());
        assert_eq!(queue.counters().acked, 2);
        let filtered = events.events_of_type(names::TASK_FILTERED);
        assert_eq!(filtered[0].1.as_ref().unwrap()["task"], "a_rgba");
        let stats = consumer.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.total(), 2);
    }

    struct GateHandler {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TaskHandler for GateHandler {
        async fn handle(&self, _task: &Task) -> Outcome {
            self.entered.notify_one();
            self.release.notified().await;
            Outcome::Success
        }
    }

    #[tokio::test]
    async fn test_same_key_in_flight_is_deferred() {
        let queue = Arc::new(InMemoryQueue::new());
        let (consumer, _events) = consumer(&queue);
        queue.publish(&body("a.png")).await.unwrap();
        queue.publish(&body("a.png")).await.unwrap();

        let handler = Arc::new(GateHandler {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let first = queue.receive().await.unwrap().unwrap();
        let second = queue.receive().await.unwrap().unwrap();

        let running = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.process(handler.as_ref(), first).await })
        };
        handler.entered.notified().await;

        assert_eq!(consumer.process(handler.as_ref(), second).await, Disposition::Deferred);
        handler.release.notify_one();
        assert_eq!(running.await.unwrap(), Disposition::Succeeded);

        assert_eq!(queue.counters().nacked, 1);
        assert_eq!(queue.ready_len(), 1);
    }

    struct CountingHandler {
        current: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _task: &Task) -> Outcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Outcome::Success
        }
    }

    #[tokio::test]
    async fn test_consume_bounds_concurrency_and_drains_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..6 {
            queue.publish(&body(&format!("img{i}.png"))).await.unwrap();
        }
        let config = ConsumerConfig {
            max_in_flight: 2,
            max_deliveries: 5,
            receive_poll: Duration::from_millis(5),
        };
        let consumer = QueueConsumer::new(queue.clone(), config);
        let handler = Arc::new(CountingHandler {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();

        let run = {
            let consumer = consumer.clone();
            let handler: Arc<dyn TaskHandler> = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.consume(handler, shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.done.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();

        let stats = run.await.unwrap();
        assert_eq!(stats.succeeded, 6);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert!(queue.is_drained());
    }
}
