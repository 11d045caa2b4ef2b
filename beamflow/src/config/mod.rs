//! Configuration.
//!
//! One JSON document, every field defaulted. Command line flags and
//! environment variables override individual fields after loading.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::SourceFilter;
use crate::errors::ConfigError;
use crate::queue::{ConsumerConfig, RedeliveryPolicy};
use crate::sentinel::{validate_name, WatchOptions};
use crate::stages::StageDefinition;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamflowConfig {
    /// Task queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Object store.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Render service.
    #[serde(default)]
    pub render: RenderConfig,
    /// Ordered pipeline stages.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageDefinition>,
    /// Handoff sentinels.
    #[serde(default)]
    pub sentinel: SentinelConfig,
    /// Root of per-task working directories.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Which source objects are pipeline inputs.
    #[serde(default)]
    pub intake: SourceFilter,
}

fn default_stages() -> Vec<StageDefinition> {
    vec![StageDefinition::render("render")]
}

fn default_work_root() -> PathBuf {
    PathBuf::from("work")
}

impl Default for BeamflowConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            render: RenderConfig::default(),
            stages: default_stages(),
            sentinel: SentinelConfig::default(),
            work_root: default_work_root(),
            intake: SourceFilter::default(),
        }
    }
}

impl BeamflowConfig {
    /// Reads and parses a JSON config file. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parses a JSON config document. Does not validate.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Applies command line and environment overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(url) = &overrides.storage_url {
            self.storage.url.clone_from(url);
        }
        if let Some(endpoint) = &overrides.render_endpoint {
            self.render.endpoint = Some(endpoint.clone());
        }
        if let Some(dir) = &overrides.spool_dir {
            self.queue.spool_dir.clone_from(dir);
        }
        if let Some(dir) = &overrides.sentinel_dir {
            self.sentinel.dir.clone_from(dir);
        }
        if let Some(root) = &overrides.work_root {
            self.work_root.clone_from(root);
        }
        if let Some(n) = overrides.max_in_flight {
            self.queue.max_in_flight = n;
        }
        self
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(invalid("at least one stage is required"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name().trim().is_empty() {
                return Err(invalid("stage names must not be empty"));
            }
            if !seen.insert(stage.name()) {
                return Err(invalid(format!("duplicate stage name '{}'", stage.name())));
            }
            match stage {
                StageDefinition::Command(command) if command.program.trim().is_empty() => {
                    return Err(invalid(format!("command stage '{}' has no program", command.name)));
                }
                StageDefinition::Render(render) if !self.render.has_endpoint() => {
                    return Err(invalid(format!(
                        "render stage '{}' requires render.endpoint",
                        render.name
                    )));
                }
                _ => {}
            }
        }

        if self.queue.max_in_flight == 0 {
            return Err(invalid("queue.max_in_flight must be at least 1"));
        }
        if self.queue.max_deliveries == 0 {
            return Err(invalid("queue.max_deliveries must be at least 1"));
        }
        if self.storage.results_prefix.trim_matches('/').is_empty() {
            return Err(invalid("storage.results_prefix must not be empty"));
        }
        if self.storage.upload_extensions.is_empty() {
            return Err(invalid("storage.upload_extensions must not be empty"));
        }
        validate_name(&format!("{}x", self.sentinel.prefix))
            .map_err(|e| invalid(format!("sentinel.prefix: {e}")))?;
        if self.sentinel.claim_timeout_seconds == 0 {
            return Err(invalid("sentinel.claim_timeout_seconds must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Overrides collected from flags and environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Replaces `storage.url`.
    pub storage_url: Option<String>,
    /// Replaces `render.endpoint`.
    pub render_endpoint: Option<String>,
    /// Replaces `queue.spool_dir`.
    pub spool_dir: Option<PathBuf>,
    /// Replaces `sentinel.dir`.
    pub sentinel_dir: Option<PathBuf>,
    /// Replaces `work_root`.
    pub work_root: Option<PathBuf>,
    /// Replaces `queue.max_in_flight`.
    pub max_in_flight: Option<usize>,
}

/// Queue and consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Spool directory shared by publishers and workers.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// Concurrent handlers per worker.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Deliveries after which a message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Backoff before a nacked message is visible again.
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
    /// Poll interval when the queue is empty.
    #[serde(default = "default_receive_poll_ms")]
    pub receive_poll_ms: u64,
    /// Claims older than this are returned to the queue at worker start.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("spool")
}

fn default_max_in_flight() -> usize {
    2
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_receive_poll_ms() -> u64 {
    500
}

fn default_visibility_timeout() -> u64 {
    3600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            max_in_flight: default_max_in_flight(),
            max_deliveries: default_max_deliveries(),
            redelivery: RedeliveryPolicy::default(),
            receive_poll_ms: default_receive_poll_ms(),
            visibility_timeout_seconds: default_visibility_timeout(),
        }
    }
}

impl QueueConfig {
    /// Consumer limits derived from this config.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_in_flight: self.max_in_flight,
            max_deliveries: self.max_deliveries,
            receive_poll: Duration::from_millis(self.receive_poll_ms),
        }
    }

    /// Visibility timeout as a duration.
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }
}

/// Object store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `gs://bucket`, `file:///dir` or `memory://`.
    #[serde(default = "default_storage_url")]
    pub url: String,
    /// Key prefix for uploaded results.
    #[serde(default = "default_results_prefix")]
    pub results_prefix: String,
    /// File extensions collected from the output directory.
    #[serde(default = "default_upload_extensions")]
    pub upload_extensions: Vec<String>,
    /// Ack tasks whose result already exists without reprocessing.
    #[serde(default = "default_skip_completed")]
    pub skip_completed: bool,
}

fn default_storage_url() -> String {
    "file://./storage".to_string()
}

fn default_results_prefix() -> String {
    "dg-results".to_string()
}

fn default_upload_extensions() -> Vec<String> {
    vec!["glb".to_string()]
}

fn default_skip_completed() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            results_prefix: default_results_prefix(),
            upload_extensions: default_upload_extensions(),
            skip_completed: default_skip_completed(),
        }
    }
}

/// Render service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Endpoint receiving the image POST.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-call timeout.
    #[serde(default = "default_render_timeout")]
    pub timeout_seconds: u64,
    /// Require the response to be binary glTF.
    #[serde(default = "default_expect_glb")]
    pub expect_glb: bool,
}

fn default_render_timeout() -> u64 {
    300
}

fn default_expect_glb() -> bool {
    true
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: default_render_timeout(),
            expect_glb: default_expect_glb(),
        }
    }
}

impl RenderConfig {
    /// Returns true if a non-blank endpoint is set.
    #[must_use]
    pub fn has_endpoint(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// Timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Sentinel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Directory holding sentinel files.
    #[serde(default = "default_sentinel_dir")]
    pub dir: PathBuf,
    /// Watcher poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Prefix of handoff sentinels; the task key follows it.
    #[serde(default = "default_sentinel_prefix")]
    pub prefix: String,
    /// Watcher claims older than this are put back for another watcher.
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,
}

fn default_sentinel_dir() -> PathBuf {
    PathBuf::from("signals")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_sentinel_prefix() -> String {
    "ready:".to_string()
}

fn default_claim_timeout() -> u64 {
    600
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            dir: default_sentinel_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            prefix: default_sentinel_prefix(),
            claim_timeout_seconds: default_claim_timeout(),
        }
    }
}

impl SentinelConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Claim timeout as a duration.
    #[must_use]
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_seconds)
    }

    /// Watch options with the configured poll interval.
    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions::every(self.poll_interval())
    }
}
