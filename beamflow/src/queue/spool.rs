//! Directory-backed durable queue.
//!
//! Layout under the spool root:
//!
//! ```text
//! ready/<id>.json      visible (or backing off) messages
//! inflight/<id>.json   messages claimed by some consumer
//! ```
//!
//! Every file is written to a dot-prefixed temp name and renamed into
//! place, and a consumer claims a message by renaming it from `ready/` to
//! `inflight/`. Several processes can share one spool; each claim has exactly
//! one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Delivery, MessageQueue, RedeliveryPolicy};
use crate::errors::QueueError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    deliveries: u32,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    claimed_at: Option<DateTime<Utc>>,
    body: String,
}

impl Envelope {
    fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|not_before| not_before > now)
    }
}

/// Durable queue shared through a directory.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    ready: PathBuf,
    inflight: PathBuf,
    policy: RedeliveryPolicy,
}

impl SpoolQueue {
    /// Opens the spool at `root`, creating its directories.
    pub async fn open(root: impl AsRef<Path>, policy: RedeliveryPolicy) -> Result<Self, QueueError> {
        let root = root.as_ref();
        let ready = root.join("ready");
        let inflight = root.join("inflight");
        for dir in [&ready, &inflight] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| QueueError::io(dir, e))?;
        }
        Ok(Self {
            ready,
            inflight,
            policy,
        })
    }

    /// Number of message files in `ready/`.
    pub async fn ready_len(&self) -> Result<usize, QueueError> {
        Ok(list_messages(&self.ready).await?.len())
    }

    /// Number of message files in `inflight/`.
    pub async fn inflight_len(&self) -> Result<usize, QueueError> {
        Ok(list_messages(&self.inflight).await?.len())
    }

    /// Returns claims older than `visibility` to `ready/`.
    ///
    /// A consumer that dies mid-task leaves its claim in `inflight/`; this
    /// makes such messages deliverable again. Returns how many were moved.
    pub async fn recover_stale(&self, visibility: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::zero());
        let mut recovered = 0;

        for id in list_messages(&self.inflight).await? {
            let path = message_path(&self.inflight, &id);
            let envelope = match read_envelope(&path).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(QueueError::Serialization(e)) => {
                    warn!(message_id = %id, error = %e, "Skipping unreadable in-flight message");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if envelope.claimed_at.is_some_and(|claimed| claimed > cutoff) {
                continue;
            }
            self.requeue(envelope, &path).await?;
            recovered += 1;
        }

        if recovered > 0 {
            warn!(recovered, "Recovered stale in-flight messages");
        }
        Ok(recovered)
    }

    async fn requeue(&self, mut envelope: Envelope, claimed_path: &Path) -> Result<(), QueueError> {
        let delay = self.policy.delay_after(envelope.deliveries);
        envelope.not_before =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        envelope.claimed_at = None;

        // Rewrite the claim in place, then move it with one rename so the id
        // is never present in both directories.
        write_atomic(&self.inflight, &envelope.id, &serde_json::to_vec(&envelope)?).await?;
        let ready_path = message_path(&self.ready, &envelope.id);
        match tokio::fs::rename(claimed_path, &ready_path).await {
            Ok(()) => Ok(()),
            // Requeued concurrently by someone else.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(claimed_path, e)),
        }
    }

    /// Claims `ready/<id>` and builds the delivery from the claimed file.
    ///
    /// The envelope is read after the rename: whatever was read before it
    /// may predate a concurrent requeue. Returns `None` if another consumer
    /// won the claim or the message turned out to be backing off.
    async fn claim_ready(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Delivery>, QueueError> {
        let ready_path = message_path(&self.ready, id);
        let claimed_path = message_path(&self.inflight, id);
        match tokio::fs::rename(&ready_path, &claimed_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::io(&ready_path, e)),
        }

        let raw = match tokio::fs::read(&claimed_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::io(&claimed_path, e)),
        };
        let Ok(mut envelope) = serde_json::from_slice::<Envelope>(&raw) else {
            // Unreadable envelope: hand the raw bytes over so the consumer drops it.
            warn!(message_id = %id, "Spool message is not a valid envelope");
            return Ok(Some(Delivery {
                token: id.to_string(),
                body: raw,
                attempt: 1,
            }));
        };

        if envelope.is_backing_off(now) {
            debug!(message_id = %id, "Claimed message is backing off, putting it back");
            return match tokio::fs::rename(&claimed_path, &ready_path).await {
                Ok(()) => Ok(None),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(QueueError::io(&claimed_path, e)),
            };
        }

        envelope.deliveries += 1;
        envelope.claimed_at = Some(now);
        write_atomic(&self.inflight, id, &serde_json::to_vec(&envelope)?).await?;

        Ok(Some(Delivery {
            token: id.to_string(),
            body: envelope.body.into_bytes(),
            attempt: envelope.deliveries,
        }))
    }

    fn claim_path(&self, token: &str) -> Result<PathBuf, QueueError> {
        if token.is_empty() || token.starts_with('.') || token.contains(['/', '\\']) {
            return Err(QueueError::UnknownToken(token.to_string()));
        }
        Ok(message_path(&self.inflight, token))
    }
}

#[async_trait]
impl MessageQueue for SpoolQueue {
    async fn publish(&self, body: &[u8]) -> Result<String, QueueError> {
        let body = std::str::from_utf8(body)
            .map_err(|e| QueueError::malformed("publish", e.to_string()))?
            .to_string();
        let envelope = Envelope {
            id: uuid::Uuid::now_v7().to_string(),
            deliveries: 0,
            not_before: None,
            claimed_at: None,
            body,
        };
        write_atomic(&self.ready, &envelope.id, &serde_json::to_vec(&envelope)?).await?;
        debug!(message_id = %envelope.id, "Published message");
        Ok(envelope.id)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();

        // uuid v7 ids sort by creation time, so this is FIFO.
        for id in list_messages(&self.ready).await? {
            // Skip messages still backing off without claiming them.
            match read_envelope(&message_path(&self.ready, &id)).await {
                Ok(Some(envelope)) if envelope.is_backing_off(now) => continue,
                Ok(None) => continue,
                Ok(Some(_)) | Err(QueueError::Serialization(_)) => {}
                Err(e) => return Err(e),
            }

            if let Some(delivery) = self.claim_ready(&id, now).await? {
                return Ok(Some(delivery));
            }
        }

        Ok(None)
    }

    async fn ack(&self, token: &str) -> Result<(), QueueError> {
        let path = self.claim_path(token)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(QueueError::UnknownToken(token.to_string())),
            Err(e) => Err(QueueError::io(&path, e)),
        }
    }

    async fn nack(&self, token: &str) -> Result<(), QueueError> {
        let path = self.claim_path(token)?;
        let envelope = read_envelope(&path)
            .await?
            .ok_or_else(|| QueueError::UnknownToken(token.to_string()))?;
        self.requeue(envelope, &path).await
    }
}

fn message_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

async fn list_messages(dir: &Path) -> Result<Vec<String>, QueueError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| QueueError::io(dir, e))?;
    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| QueueError::io(dir, e))? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        if let Some(id) = name.strip_suffix(".json") {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

async fn read_envelope(path: &Path) -> Result<Option<Envelope>, QueueError> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(QueueError::io(path, e)),
    }
}

async fn write_atomic(dir: &Path, id: &str, bytes: &[u8]) -> Result<(), QueueError> {
    let tmp = dir.join(format!(".{id}.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| QueueError::io(&tmp, e))?;
    let target = message_path(dir, id);
    tokio::fs::rename(&tmp, &target)
        .await
        .map_err(|e| QueueError::io(&target, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BackoffStrategy, JitterStrategy};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> SpoolQueue {
        SpoolQueue::open(dir.path(), RedeliveryPolicy::immediate())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;

        let id = queue.publish(br#"{"filename":"a.png"}"#).await.unwrap();
        assert_eq!(queue.ready_len().await.unwrap(), 1);

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.token, id);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.body, br#"{"filename":"a.png"}"#);
        assert_eq!(queue.ready_len().await.unwrap(), 0);
        assert_eq!(queue.inflight_len().await.unwrap(), 1);

        queue.ack(&delivery.token).await.unwrap();
        assert_eq!(queue.inflight_len().await.unwrap(), 0);
        assert!(matches!(
            queue.ack(&delivery.token).await,
            Err(QueueError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        queue.publish(b"first").await.unwrap();
        queue.publish(b"second").await.unwrap();

        assert_eq!(queue.receive().await.unwrap().unwrap().body, b"first");
        assert_eq!(queue.receive().await.unwrap().unwrap().body, b"second");
    }

    #[tokio::test]
    async fn test_nack_increments_attempt() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        queue.publish(b"x").await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.nack(&first.token).await.unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.token, first.token);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_nack_backoff_hides_message() {
        let dir = TempDir::new().unwrap();
        let policy = RedeliveryPolicy::default()
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::None)
            .with_delays_ms(60_000, 60_000);
        let queue = SpoolQueue::open(dir.path(), policy).await.unwrap();
        queue.publish(b"x").await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.nack(&first.token).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.ready_len().await.unwrap(), 1);
    }

    fn rewrite_ready(dir: &TempDir, id: &str, deliveries: u32, not_before: Option<DateTime<Utc>>) {
        let path = dir.path().join(format!("ready/{id}.json"));
        let mut envelope: Envelope = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        envelope.deliveries = deliveries;
        envelope.not_before = not_before;
        std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_claim_reads_envelope_after_rename() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        let id = queue.publish(b"x").await.unwrap();

        // Rescheduled by a concurrent nack after this consumer last looked.
        rewrite_ready(&dir, &id, 2, Some(Utc::now() + chrono::Duration::minutes(5)));
        assert_eq!(queue.claim_ready(&id, Utc::now()).await.unwrap(), None);
        assert_eq!(queue.ready_len().await.unwrap(), 1);
        assert_eq!(queue.inflight_len().await.unwrap(), 0);
        assert!(queue.receive().await.unwrap().is_none());

        rewrite_ready(&dir, &id, 2, None);
        let delivery = queue.claim_ready(&id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 3);
        assert_eq!(queue.claim_ready(&id, Utc::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nack_leaves_no_claim_behind() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        queue.publish(b"x").await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue.nack(&delivery.token).await.unwrap();
        assert_eq!(queue.inflight_len().await.unwrap(), 0);
        assert_eq!(queue.ready_len().await.unwrap(), 1);
        assert!(matches!(
            queue.nack(&delivery.token).await,
            Err(QueueError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_envelope_is_delivered_raw() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        std::fs::write(dir.path().join("ready/0000-bad.json"), b"not json").unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.token, "0000-bad");
        assert_eq!(delivery.body, b"not json");
        queue.ack(&delivery.token).await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_stale_claims() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        queue.publish(b"x").await.unwrap();
        let first = queue.receive().await.unwrap().unwrap();

        assert_eq!(queue.recover_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.recover_stale(Duration::ZERO).await.unwrap(), 1);

        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.token, first.token);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_claim_rejects_path_tokens() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir).await;
        assert!(queue.ack("../ready/x").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_receivers_claim_each_message_once() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open(&dir).await);
        for i in 0..20 {
            queue.publish(format!("m{i}").as_bytes()).await.unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(d) = queue.receive().await.unwrap() {
                        got.push(d.token);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .flat_map(Result::unwrap)
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
