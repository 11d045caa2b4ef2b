//! Task type built from a queue delivery.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

use crate::errors::QueueError;
use crate::storage::BlobRef;

/// The JSON body published by the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Base file name of the uploaded image.
    pub filename: String,
    /// Where the image was stored, e.g. `gs://bucket/fullbodyimages/a.png`.
    pub storage_path: String,
}

impl TaskMessage {
    /// Creates a new message.
    #[must_use]
    pub fn new(filename: impl Into<String>, storage_path: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            storage_path: storage_path.into(),
        }
    }
}

#[allow(clippy::expect_used)]
static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("task key pattern is valid"));

/// Returns true if `key` is usable as a task key.
///
/// Keys name working directories and sentinels, so they must start with an
/// alphanumeric character and contain no path separators.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    KEY_PATTERN.is_match(key)
}

/// One unit of pipeline work.
///
/// `id` is the queue delivery token and changes across redeliveries. The
/// source blob reference, and the key derived from the file name, stay the
/// same and serve as the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Queue-assigned delivery token.
    pub id: String,
    /// Base file name of the source image.
    pub filename: String,
    /// Location of the source image.
    pub source_blob_ref: BlobRef,
    /// When this delivery was received.
    pub received_at: DateTime<Utc>,
    /// 1 for the first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
    key: String,
}

impl Task {
    /// Parses a delivery body into a task.
    ///
    /// Any problem with the body is reported as [`QueueError::Malformed`],
    /// which the consumer treats as a permanent failure.
    pub fn from_delivery(
        id: impl Into<String>,
        body: &[u8],
        delivery_attempt: u32,
    ) -> Result<Self, QueueError> {
        let id = id.into();
        let message: TaskMessage = serde_json::from_slice(body)
            .map_err(|e| QueueError::malformed(&id, format!("invalid JSON body: {e}")))?;
        Self::from_message(id, message, delivery_attempt)
    }

    /// Builds a task from an already-decoded message.
    pub fn from_message(
        id: impl Into<String>,
        message: TaskMessage,
        delivery_attempt: u32,
    ) -> Result<Self, QueueError> {
        let id = id.into();
        let filename = message.filename.trim().to_string();
        if filename.is_empty() {
            return Err(QueueError::malformed(&id, "filename is empty"));
        }
        if filename.contains('/') || filename.contains('\\') {
            return Err(QueueError::malformed(
                &id,
                format!("filename '{filename}' contains a path separator"),
            ));
        }

        let key = Path::new(&filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if !is_valid_key(&key) {
            return Err(QueueError::malformed(
                &id,
                format!("filename '{filename}' does not yield a usable task key"),
            ));
        }

        let source_blob_ref = BlobRef::parse(&message.storage_path)
            .map_err(|e| QueueError::malformed(&id, e.to_string()))?;

        Ok(Self {
            id,
            filename,
            source_blob_ref,
            received_at: Utc::now(),
            delivery_attempt,
            key,
        })
    }

    /// The file stem, used for working directories, sentinels and dedup.
    ///
    /// Outputs are named `<stem>.glb`, so files that differ only in
    /// extension are the same task. The default [`SourceFilter`] admits only
    /// `.png` sources, which keeps such pairs out.
    ///
    /// [`SourceFilter`]: crate::core::SourceFilter
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The handoff sentinel this task posts once its stages are done.
    #[must_use]
    pub fn sentinel_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.key)
    }
}
