//! Stage result type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::StageStatus;

/// Typed result of one stage run.
///
/// Lives only as long as the coordinating process. A crash loses it, which is
/// fine because the queue redelivers the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,
    /// Stage status.
    pub status: StageStatus,
    /// Exit code and output tail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_detail: Option<String>,
    /// Declared outputs, verified to exist when the status is ok.
    #[serde(default)]
    pub produced_refs: Vec<PathBuf>,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub ended_at: DateTime<Utc>,
}

impl StageResult {
    /// Creates a successful stage result.
    #[must_use]
    pub fn ok(
        stage_name: impl Into<String>,
        started_at: DateTime<Utc>,
        produced_refs: Vec<PathBuf>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Ok,
            exit_detail: None,
            produced_refs,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Creates a failed stage result.
    #[must_use]
    pub fn failed(
        stage_name: impl Into<String>,
        started_at: DateTime<Utc>,
        exit_detail: impl Into<String>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Failed,
            exit_detail: Some(exit_detail.into()),
            produced_refs: Vec::new(),
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_result_ok() {
        let result = StageResult::ok("render", Utc::now(), vec![PathBuf::from("a.glb")]);
        assert!(result.is_success());
        assert!(result.exit_detail.is_none());
        assert_eq!(result.produced_refs.len(), 1);
    }

    #[test]
    fn test_stage_result_failed() {
        let result = StageResult::failed("render", Utc::now(), "exit code 2");
        assert!(!result.is_success());
        assert!(result.produced_refs.is_empty());
        assert_eq!(result.exit_detail.as_deref(), Some("exit code 2"));
    }

    #[test]
    fn test_stage_result_duration() {
        let started = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let result = StageResult::ok("convert", started, Vec::new());
        assert!(result.duration_ms() >= 10);
    }
}
