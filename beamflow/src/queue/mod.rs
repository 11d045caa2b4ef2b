//! Durable task queue and the consumer that drives it.
//!
//! A [`MessageQueue`] hands out [`Delivery`] values and takes them back with
//! `ack` (done, delete) or `nack` (make visible again after backoff). Delivery
//! is at-least-once. Only the [`QueueConsumer`] talks to a queue while the
//! pipeline runs.

mod backoff;
mod consumer;
mod memory;
mod spool;

pub use backoff::{BackoffStrategy, JitterStrategy, RedeliveryPolicy};
pub use consumer::{ConsumerConfig, ConsumerStats, Disposition, QueueConsumer, TaskHandler};
pub use memory::{InMemoryQueue, QueueCounters};
pub use spool::SpoolQueue;

use async_trait::async_trait;

use crate::errors::QueueError;

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque token for `ack`/`nack`. Stable across redeliveries.
    pub token: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

/// At-least-once message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publishes a message body. Returns the message id.
    async fn publish(&self, body: &[u8]) -> Result<String, QueueError>;

    /// Claims the next visible message, if any. Does not block.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Deletes a claimed message.
    async fn ack(&self, token: &str) -> Result<(), QueueError>;

    /// Returns a claimed message to the queue for a later redelivery.
    async fn nack(&self, token: &str) -> Result<(), QueueError>;
}
