//! In-memory message queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use super::{Delivery, MessageQueue, RedeliveryPolicy};
use crate::errors::QueueError;

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: Vec<u8>,
    deliveries: u32,
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Stored>,
    inflight: HashMap<String, Stored>,
}

/// Snapshot of queue activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    /// Messages published.
    pub published: u64,
    /// Deliveries handed out, redeliveries included.
    pub delivered: u64,
    /// Acks received.
    pub acked: u64,
    /// Nacks received.
    pub nacked: u64,
}

/// Process-local queue with the same visibility rules as [`super::SpoolQueue`].
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    policy: RedeliveryPolicy,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl InMemoryQueue {
    /// Creates a queue that redelivers nacked messages immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(RedeliveryPolicy::immediate())
    }

    /// Creates a queue with the given redelivery backoff.
    #[must_use]
    pub fn with_policy(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Current counters.
    #[must_use]
    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            published: self.published.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
        }
    }

    /// Messages waiting for delivery, including those still backing off.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Messages claimed but neither acked nor nacked.
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Returns true when nothing is ready or in flight.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.ready.is_empty() && state.inflight.is_empty()
    }

    /// Publishes a message that has already been delivered `deliveries` times.
    pub fn publish_redelivered(&self, body: &[u8], deliveries: u32) -> String {
        let id = uuid::Uuid::now_v7().to_string();
        self.state.lock().ready.push_back(Stored {
            id: id.clone(),
            body: body.to_vec(),
            deliveries,
            not_before: None,
        });
        self.published.fetch_add(1, Ordering::SeqCst);
        id
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, body: &[u8]) -> Result<String, QueueError> {
        Ok(self.publish_redelivered(body, 0))
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(position) = state
            .ready
            .iter()
            .position(|m| m.not_before.map_or(true, |t| t <= now))
        else {
            return Ok(None);
        };
        let Some(mut message) = state.ready.remove(position) else {
            return Ok(None);
        };

        message.deliveries += 1;
        message.not_before = None;
        let delivery = Delivery {
            token: message.id.clone(),
            body: message.body.clone(),
            attempt: message.deliveries,
        };
        state.inflight.insert(message.id.clone(), message);
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(Some(delivery))
    }

    async fn ack(&self, token: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .inflight
            .remove(token)
            .ok_or_else(|| QueueError::UnknownToken(token.to_string()))?;
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, token: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let mut message = state
            .inflight
            .remove(token)
            .ok_or_else(|| QueueError::UnknownToken(token.to_string()))?;
        message.not_before = Some(Instant::now() + self.policy.delay_after(message.deliveries));
        state.ready.push_back(message);
        self.nacked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
