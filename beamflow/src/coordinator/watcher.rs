//! Watcher role: take handoff sentinels, upload outputs, clean up.
//!
//! Any number of watchers may poll the same sentinel store. Only the one
//! whose `claim` succeeds proceeds with a task; the others see `false` and
//! move on. The claim is released once the workdir is gone. A claim left by
//! a crashed watcher goes back to pending after `claim_timeout`.

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{PipelineState, StateTracker};
use super::workdir::TaskWorkdir;
use crate::config::BeamflowConfig;
use crate::core::{is_valid_key, OutputArtifact};
use crate::errors::{BeamflowError, SentinelError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::sentinel::SentinelStore;
use crate::storage::ObjectStoreClient;

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Root of task working directories.
    pub work_root: PathBuf,
    /// Key prefix uploads go under.
    pub results_prefix: String,
    /// File extensions uploaded from `output/`.
    pub upload_extensions: Vec<String>,
    /// Prefix of the handoff sentinel.
    pub sentinel_prefix: String,
    /// Delay between sweeps.
    pub poll_interval: Duration,
    /// Claims older than this are considered abandoned and put back.
    pub claim_timeout: Duration,
}

impl WatcherSettings {
    /// Settings with the default prefixes, `.glb` uploads, a 1s poll and a
    /// 10 minute claim timeout.
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            results_prefix: "dg-results".to_string(),
            upload_extensions: vec!["glb".to_string()],
            sentinel_prefix: "ready:".to_string(),
            poll_interval: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(600),
        }
    }

    /// Settings taken from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &BeamflowConfig) -> Self {
        Self {
            work_root: config.work_root.clone(),
            results_prefix: config.storage.results_prefix.clone(),
            upload_extensions: config.storage.upload_extensions.clone(),
            sentinel_prefix: config.sentinel.prefix.clone(),
            poll_interval: config.sentinel.poll_interval(),
            claim_timeout: config.sentinel.claim_timeout(),
        }
    }
}

/// What the watcher did for one taken sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    /// Task key.
    pub task: String,
    /// Remote keys written.
    pub uploaded: Vec<String>,
    /// States visited.
    pub states: Vec<PipelineState>,
}

/// Uploads finished task outputs.
pub struct Watcher {
    store: Arc<dyn ObjectStoreClient>,
    sentinels: Arc<dyn SentinelStore>,
    settings: WatcherSettings,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a watcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        sentinels: Arc<dyn SentinelStore>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            sentinels,
            settings,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sweeps until `shutdown` fires.
    ///
    /// A failed sweep is logged and retried on the next tick. An unavailable
    /// sentinel store is never mistaken for "nothing to do".
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            prefix = %self.settings.sentinel_prefix,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "Watcher started"
        );
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sweep().await {
                Ok(handoffs) if !handoffs.is_empty() => {
                    debug!(count = handoffs.len(), "Sweep completed handoffs");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Watcher sweep failed"),
            }
        }
        info!("Watcher stopped");
    }

    /// Restores stale claims, then tries every pending sentinel once.
    ///
    /// Per-task failures are logged and do not stop the sweep. Only a failure
    /// of the sentinel store itself is returned.
    pub async fn sweep(&self) -> Result<Vec<Handoff>, BeamflowError> {
        let prefix = &self.settings.sentinel_prefix;
        for name in self.sentinels.recover_stale(prefix, self.settings.claim_timeout).await? {
            warn!(sentinel = %name, "Claim abandoned by a previous watcher, retrying handoff");
            self.events
                .emit(names::HANDOFF_RECOVERED, Some(json!({ "sentinel": &name })))
                .await;
        }

        let pending = self.sentinels.pending(prefix).await?;
        let mut handoffs = Vec::new();
        for name in pending {
            match self.process_sentinel(&name).await {
                Ok(Some(handoff)) => handoffs.push(handoff),
                Ok(None) => {}
                Err(e) => warn!(sentinel = %name, error = %e, "Handoff failed"),
            }
        }
        Ok(handoffs)
    }

    /// Waits for one task's sentinel, then uploads and cleans up.
    pub async fn watch_task(&self, key: &str, shutdown: &CancellationToken) -> Result<Handoff, BeamflowError> {
        let name = format!("{}{key}", self.settings.sentinel_prefix);
        loop {
            if let Some(handoff) = self.process_sentinel(&name).await? {
                return Ok(handoff);
            }
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    return Err(SentinelError::Cancelled { name }.into());
                }
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Claims `name` and handles the task behind it.
    ///
    /// Returns `None` if another watcher claimed the sentinel first.
    pub async fn process_sentinel(&self, name: &str) -> Result<Option<Handoff>, BeamflowError> {
        let Some(key) = name.strip_prefix(&self.settings.sentinel_prefix) else {
            return Ok(None);
        };
        if !is_valid_key(key) {
            return Err(BeamflowError::InvalidInput(format!(
                "sentinel '{name}' does not name a task"
            )));
        }
        if !self.sentinels.claim(name).await? {
            debug!(sentinel = name, "Sentinel already claimed by another watcher");
            return Ok(None);
        }
        self.claimed(name, key).await.map(Some)
    }

    async fn claimed(&self, name: &str, key: &str) -> Result<Handoff, BeamflowError> {
        self.events
            .emit(names::SENTINEL_TAKEN, Some(json!({ "task": key, "sentinel": name })))
            .await;

        let err = match self.upload_and_clean(key).await {
            Ok(handoff) => {
                self.sentinels.release(name).await?;
                return Ok(handoff);
            }
            Err(err) => err,
        };

        // Left claimed; recover_stale puts it back after the claim timeout.
        let restored = if matches!(err, BeamflowError::MissingOutputs { .. }) {
            false
        } else {
            match self.sentinels.restore(name).await {
                Ok(restored) => restored,
                Err(restore_err) => {
                    error!(sentinel = name, error = %restore_err, "Failed to restore sentinel after handoff error");
                    false
                }
            }
        };
        self.events
            .emit(
                names::HANDOFF_FAILED,
                Some(json!({
                    "task": key,
                    "sentinel": name,
                    "reason": err.to_string(),
                    "restored": restored,
                })),
            )
            .await;
        Err(err)
    }

    async fn upload_and_clean(&self, key: &str) -> Result<Handoff, BeamflowError> {
        let mut tracker = StateTracker::starting_at(key, PipelineState::SentinelPosted);
        let workdir = TaskWorkdir::locate(&self.settings.work_root, key)?;

        let outputs = workdir.outputs(&self.settings.upload_extensions).await?;
        if outputs.is_empty() {
            return Err(BeamflowError::MissingOutputs {
                task: key.to_string(),
                workdir: workdir.output_dir(),
            });
        }

        let mut uploaded = Vec::with_capacity(outputs.len());
        for path in outputs {
            let artifact = OutputArtifact::under_prefix(path, &self.settings.results_prefix);
            self.store
                .upload(&artifact.local_path, &artifact.remote_key)
                .await?;
            info!(task = key, remote_key = %artifact.remote_key, kind = %artifact.content_kind, "Uploaded artifact");
            self.events
                .emit(
                    names::ARTIFACT_UPLOADED,
                    Some(json!({
                        "task": key,
                        "remote_key": &artifact.remote_key,
                        "content_kind": artifact.content_kind.to_string(),
                    })),
                )
                .await;
            uploaded.push(artifact.remote_key);
        }
        tracker.advance(PipelineState::Uploaded)?;

        workdir.remove().await?;
        tracker.advance(PipelineState::Cleaned)?;
        debug!(task = key, "Workdir removed");

        Ok(Handoff {
            task: key.to_string(),
            uploaded,
            states: tracker.history().to_vec(),
        })
    }
}
