//! Error types for the beamflow pipeline.
//!
//! Every component classifies its failures at the point of origin into an
//! [`ErrorClass`]. The coordinator turns that class into an ack/nack
//! [`Outcome`](crate::core::Outcome); nothing below the coordinator talks to
//! the queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy shared by all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or storage hiccup. Retried through queue redelivery.
    TransientIo,
    /// Malformed task or missing required file. Acked and dropped.
    InvalidInput,
    /// Subprocess exited nonzero or did not produce a declared output.
    StageExecution,
    /// Render service call failed.
    ExternalService {
        /// Whether the failure is worth a redelivery.
        retryable: bool,
    },
}

impl ErrorClass {
    /// Returns true if a redelivery of the whole task may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientIo | Self::StageExecution => true,
            Self::InvalidInput => false,
            Self::ExternalService { retryable } => *retryable,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientIo => write!(f, "transient_io"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::StageExecution => write!(f, "stage_execution"),
            Self::ExternalService { retryable: true } => write!(f, "external_service_retryable"),
            Self::ExternalService { retryable: false } => write!(f, "external_service_fatal"),
        }
    }
}

/// The main error type for beamflow operations.
#[derive(Debug, Error)]
pub enum BeamflowError {
    /// Sentinel store failure.
    #[error("{0}")]
    Sentinel(#[from] SentinelError),

    /// Object store failure.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// Queue failure.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// Render service failure.
    #[error("{0}")]
    Render(#[from] RenderError),

    /// Configuration failure.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The task itself cannot be processed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stage ran but did not succeed.
    #[error("Stage '{stage}' failed: {detail}")]
    StageExecution {
        /// The stage name.
        stage: String,
        /// Exit code and output tail, or the missing output.
        detail: String,
    },

    /// A posted handoff has nothing to upload.
    #[error("No outputs to upload for task '{task}' in {}", workdir.display())]
    MissingOutputs {
        /// The task key.
        task: String,
        /// Where the outputs were expected.
        workdir: PathBuf,
    },

    /// The pipeline tried to move backwards or out of a terminal state.
    #[error("Invalid pipeline transition for '{task}': {from} -> {to}")]
    InvalidTransition {
        /// The task key.
        task: String,
        /// The current state.
        from: String,
        /// The rejected state.
        to: String,
    },

    /// IO error on the local working directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeamflowError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn stage_execution(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Classifies the error into the shared taxonomy.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Sentinel(e) => e.classify(),
            Self::Storage(e) => e.classify(),
            Self::Queue(e) => e.classify(),
            Self::Render(e) => e.classify(),
            Self::Config(_)
            | Self::InvalidInput(_)
            | Self::InvalidTransition { .. }
            | Self::MissingOutputs { .. } => ErrorClass::InvalidInput,
            Self::StageExecution { .. } => ErrorClass::StageExecution,
            Self::Io(_) => ErrorClass::TransientIo,
        }
    }
}

/// Errors raised by a sentinel store.
///
/// An unavailable backing store is always an error. It is never reported as
/// "sentinel absent", otherwise stage transitions would be silently dropped.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// The sentinel name cannot be mapped onto the store.
    #[error("Invalid sentinel name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The backing location is missing or unreadable.
    #[error("Sentinel store unavailable at {}: {source}", dir.display())]
    Unavailable {
        /// The sentinel directory.
        dir: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A post or take failed for a reason other than absence.
    #[error("Sentinel '{name}' IO error: {source}")]
    Io {
        /// The sentinel name.
        name: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// `watch` gave up before the sentinel appeared.
    #[error("Timed out after {timeout_ms}ms waiting for sentinel '{name}'")]
    WatchTimeout {
        /// The sentinel name.
        name: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// `watch` was cancelled by shutdown.
    #[error("Watch on sentinel '{name}' cancelled")]
    Cancelled {
        /// The sentinel name.
        name: String,
    },
}

impl SentinelError {
    /// Creates an invalid name error.
    #[must_use]
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Classifies the error into the shared taxonomy.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::InvalidName { .. } => ErrorClass::InvalidInput,
            _ => ErrorClass::TransientIo,
        }
    }
}

/// Errors raised by the object store client.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A blob reference could not be parsed.
    #[error("Invalid blob reference '{reference}': {reason}")]
    InvalidRef {
        /// The raw reference.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The requested key does not exist.
    #[error("Blob not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The store URL is not supported.
    #[error("Unsupported storage url '{url}'")]
    UnsupportedUrl {
        /// The rejected url.
        url: String,
    },

    /// Backend error.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Local file error while staging a transfer.
    #[error("Local file error at {}: {source}", path.display())]
    Io {
        /// The local path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Creates an invalid reference error.
    #[must_use]
    pub fn invalid_ref(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRef {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Classifies the error into the shared taxonomy.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::InvalidRef { .. } | Self::NotFound { .. } | Self::UnsupportedUrl { .. } => {
                ErrorClass::InvalidInput
            }
            Self::ObjectStore(object_store::Error::NotFound { .. }) => ErrorClass::InvalidInput,
            Self::ObjectStore(_) | Self::Io { .. } => ErrorClass::TransientIo,
        }
    }
}

/// Errors raised by a message queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The message body is not a valid task.
    #[error("Malformed message {token}: {reason}")]
    Malformed {
        /// The delivery token.
        token: String,
        /// Why parsing failed.
        reason: String,
    },

    /// Ack or nack for a token that is not in flight.
    #[error("Unknown delivery token: {0}")]
    UnknownToken(String),

    /// Spool directory failure.
    #[error("Queue IO error at {}: {source}", path.display())]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Envelope serialization failure.
    #[error("Queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Creates a malformed message error.
    #[must_use]
    pub fn malformed(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error for a path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classifies the error into the shared taxonomy.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Malformed { .. } | Self::UnknownToken(_) => ErrorClass::InvalidInput,
            Self::Io { .. } | Self::Serialization(_) => ErrorClass::TransientIo,
        }
    }
}

/// Errors raised by the render invoker.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The service answered with a non-2xx status.
    #[error("Render service returned HTTP {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// A truncated response body.
        body: String,
    },

    /// Connection, DNS or protocol failure.
    #[error("Render transport error: {0}")]
    Transport(String),

    /// The call exceeded its timeout.
    #[error("Render call timed out after {0}s")]
    Timeout(u64),

    /// 2xx response whose body is not a usable asset.
    #[error("Render payload rejected: {0}")]
    InvalidPayload(String),

    /// A render stage was configured without an endpoint.
    #[error("Render endpoint is not configured")]
    NotConfigured,
}

impl RenderError {
    /// Classifies the error into the shared taxonomy.
    ///
    /// 4xx other than 408 and 429 means the input itself was rejected.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        let retryable = match self {
            Self::Status { status, .. } => {
                !((400..500).contains(status) && *status != 408 && *status != 429)
            }
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::InvalidPayload(_) | Self::NotConfigured => false,
        };
        ErrorClass::ExternalService { retryable }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// The config parsed but is inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> RenderError {
        RenderError::Status {
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_render_status_classification() {
        assert!(status(503).classify().is_retryable());
        assert!(status(500).classify().is_retryable());
        assert!(status(429).classify().is_retryable());
        assert!(status(408).classify().is_retryable());
        assert!(!status(400).classify().is_retryable());
        assert!(!status(415).classify().is_retryable());
        assert!(status(302).classify().is_retryable());
    }

    #[test]
    fn test_render_transport_and_payload() {
        assert!(RenderError::Transport("reset".into()).classify().is_retryable());
        assert!(RenderError::Timeout(300).classify().is_retryable());
        assert!(!RenderError::InvalidPayload("empty".into())
            .classify()
            .is_retryable());
    }

    #[test]
    fn test_stage_execution_is_retryable_by_redelivery() {
        let err = BeamflowError::stage_execution("render", "exit code 1");
        assert_eq!(err.classify(), ErrorClass::StageExecution);
        assert!(err.classify().is_retryable());
        assert!(err.to_string().contains("render"));
    }

    #[test]
    fn test_sentinel_unavailable_is_transient() {
        let err = SentinelError::Unavailable {
            dir: PathBuf::from("/missing"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.classify(), ErrorClass::TransientIo);
        assert_eq!(
            SentinelError::invalid_name("a/b", "path separator").classify(),
            ErrorClass::InvalidInput
        );
    }

    #[test]
    fn test_storage_not_found_is_invalid_input() {
        let err = BeamflowError::from(StorageError::NotFound {
            key: "fullbodyimages/a.png".into(),
        });
        assert_eq!(err.classify(), ErrorClass::InvalidInput);
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::TransientIo.to_string(), "transient_io");
        assert_eq!(
            ErrorClass::ExternalService { retryable: false }.to_string(),
            "external_service_fatal"
        );
    }
}
