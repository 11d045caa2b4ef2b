//! Sentinel store for cross-process stage handoff.
//!
//! A sentinel is a named marker that is either present or absent. The
//! producing stage posts it; exactly one watcher takes it. `take` is a
//! compare-and-delete, so when several watchers poll the same name only one
//! of them ever observes `true` for a given post.
//!
//! A watcher that needs to survive a crash uses `claim` instead: the sentinel
//! moves into a claimed state that outlives the process until `release`.
//! Claims older than a visibility timeout go back to pending through
//! [`SentinelStore::recover_stale`].

mod fs;
mod memory;

pub use fs::FileSentinelStore;
pub use memory::InMemorySentinelStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::SentinelError;

/// Polling parameters for [`SentinelStore::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOptions {
    /// Delay between two `take` attempts. Bounds handoff latency.
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl WatchOptions {
    /// Creates options with the given poll interval and no timeout.
    #[must_use]
    pub fn every(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            timeout: None,
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A sentinel held by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Sentinel name.
    pub name: String,
    /// Time since the claim was made.
    pub age: Duration,
}

/// Rejects names that cannot be mapped safely onto a flat namespace.
pub fn validate_name(name: &str) -> Result<(), SentinelError> {
    if name.is_empty() {
        return Err(SentinelError::invalid_name(name, "empty name"));
    }
    if name.len() > 200 {
        return Err(SentinelError::invalid_name(name, "longer than 200 bytes"));
    }
    if name.starts_with('.') {
        return Err(SentinelError::invalid_name(name, "leading dot"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(SentinelError::invalid_name(name, "path separator or NUL"));
    }
    Ok(())
}

/// Storage for presence-only handoff signals.
///
/// Implementations must fail loudly when their backing storage is
/// unavailable; reporting "absent" instead would drop a stage transition.
#[async_trait]
pub trait SentinelStore: Send + Sync {
    /// Creates the sentinel. Posting an already-present sentinel is a no-op.
    async fn post(&self, name: &str) -> Result<(), SentinelError>;

    /// Atomically tests and removes the sentinel.
    ///
    /// Returns true exactly once per post.
    async fn take(&self, name: &str) -> Result<bool, SentinelError>;

    /// Names of currently present sentinels starting with `prefix`.
    ///
    /// Listing grants nothing; only a successful `take` does.
    async fn pending(&self, prefix: &str) -> Result<Vec<String>, SentinelError>;

    /// Atomically moves a present sentinel into the claimed state.
    ///
    /// Returns true for exactly one caller per post. The claim stays until
    /// [`release`](Self::release) or [`restore`](Self::restore).
    async fn claim(&self, name: &str) -> Result<bool, SentinelError>;

    /// Forgets a claim once the work behind it is finished. Releasing an
    /// absent claim is a no-op.
    async fn release(&self, name: &str) -> Result<(), SentinelError>;

    /// Turns a claim back into a pending sentinel.
    ///
    /// Returns false if there was no such claim.
    async fn restore(&self, name: &str) -> Result<bool, SentinelError>;

    /// Current claims whose name starts with `prefix`.
    async fn claimed(&self, prefix: &str) -> Result<Vec<Claim>, SentinelError>;

    /// Restores every claim under `prefix` at least `visibility` old.
    ///
    /// Returns the restored names. Claims restored concurrently by another
    /// caller are skipped.
    async fn recover_stale(&self, prefix: &str, visibility: Duration) -> Result<Vec<String>, SentinelError> {
        let mut restored = Vec::new();
        for claim in self.claimed(prefix).await? {
            if claim.age >= visibility && self.restore(&claim.name).await? {
                debug!(sentinel = %claim.name, age_ms = claim.age.as_millis() as u64, "Stale claim restored");
                restored.push(claim.name);
            }
        }
        Ok(restored)
    }

    /// Polls `take` until it succeeds, the timeout expires or `shutdown` fires.
    async fn watch(
        &self,
        name: &str,
        options: &WatchOptions,
        shutdown: &CancellationToken,
    ) -> Result<(), SentinelError> {
        validate_name(name)?;
        let started = Instant::now();

        loop {
            if self.take(name).await? {
                debug!(sentinel = name, waited_ms = started.elapsed().as_millis() as u64, "Sentinel taken");
                return Ok(());
            }

            if let Some(timeout) = options.timeout {
                if started.elapsed() >= timeout {
                    return Err(SentinelError::WatchTimeout {
                        name: name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }

            trace!(sentinel = name, "Sentinel absent, polling again");
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    return Err(SentinelError::Cancelled { name: name.to_string() });
                }
                () = tokio::time::sleep(options.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("ready:a").is_ok());
        assert!(validate_name("ready_for_upload").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".taken-x").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(201)).is_err());
    }

    #[tokio::test]
    async fn test_two_watchers_one_post() {
        let store = Arc::new(InMemorySentinelStore::new());
        let shutdown = CancellationToken::new();
        let options = WatchOptions::every(Duration::from_millis(5))
            .with_timeout(Duration::from_millis(300));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                store.watch("ready:a", &options, &shutdown).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.post("ready:a").await.unwrap();

        let mut proceeded = 0;
        let mut still_waiting = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => proceeded += 1,
                Err(SentinelError::WatchTimeout { .. }) => still_waiting += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(proceeded, 1);
        assert_eq!(still_waiting, 1);
        assert!(!store.is_present("ready:a"));
    }

    #[tokio::test]
    async fn test_recover_stale_respects_visibility() {
        let store = InMemorySentinelStore::new();
        store.post("ready:a").await.unwrap();
        assert!(store.claim("ready:a").await.unwrap());

        let kept = store
            .recover_stale("ready:", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(kept.is_empty());
        assert!(store.pending("ready:").await.unwrap().is_empty());

        let restored = store.recover_stale("ready:", Duration::ZERO).await.unwrap();
        assert_eq!(restored, vec!["ready:a"]);
        assert_eq!(store.pending("ready:").await.unwrap(), vec!["ready:a"]);
        assert!(store.claimed("ready:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_cancelled() {
        let store = InMemorySentinelStore::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let err = store
            .watch("ready:a", &WatchOptions::every(Duration::from_secs(60)), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_watch_returns_immediately_when_present() {
        let store = InMemorySentinelStore::new();
        store.post("ready:a").await.unwrap();

        let shutdown = CancellationToken::new();
        store
            .watch("ready:a", &WatchOptions::every(Duration::from_secs(60)), &shutdown)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_surfaces_unavailable_store() {
        let store = InMemorySentinelStore::new();
        store.set_available(false);

        let err = store
            .watch(
                "ready:a",
                &WatchOptions::every(Duration::from_millis(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::Unavailable { .. }));
    }
}
