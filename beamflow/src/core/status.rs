//! Stage status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Exit code 0 and every declared output exists.
    Ok,
    /// Nonzero exit, timeout, or a declared output is missing.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }
}
