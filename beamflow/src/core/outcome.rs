//! Handler outcome reported to the queue consumer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::BeamflowError;

/// What the queue consumer should do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// Ack. The message will not be delivered again.
    Success,
    /// Nack. The queue redelivers after its backoff.
    RetryableFailure(String),
    /// Ack anyway so a poison message cannot loop, and report it.
    FatalFailure(String),
}

impl Outcome {
    /// Builds a retryable failure.
    #[must_use]
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(reason.into())
    }

    /// Builds a fatal failure.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure(reason.into())
    }

    /// Maps a classified error onto an outcome.
    #[must_use]
    pub fn from_error(err: &BeamflowError) -> Self {
        let class = err.classify();
        let reason = format!("{class}: {err}");
        if class.is_retryable() {
            Self::RetryableFailure(reason)
        } else {
            Self::FatalFailure(reason)
        }
    }

    /// Returns true if the message must be acknowledged.
    #[must_use]
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::RetryableFailure(_))
    }

    /// Returns the failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(r) | Self::FatalFailure(r) => Some(r),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RetryableFailure(r) => write!(f, "retryable_failure: {r}"),
            Self::FatalFailure(r) => write!(f, "fatal_failure: {r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RenderError;

    #[test]
    fn test_ack_policy() {
        assert!(Outcome::Success.should_ack());
        assert!(Outcome::fatal("bad input").should_ack());
        assert!(!Outcome::retryable("503").should_ack());
    }

    #[test]
    fn test_from_error() {
        let transient = BeamflowError::from(RenderError::Status {
            status: 503,
            body: "unavailable".into(),
        });
        assert!(matches!(
            Outcome::from_error(&transient),
            Outcome::RetryableFailure(_)
        ));

        let fatal = BeamflowError::InvalidInput("not a png".into());
        let outcome = Outcome::from_error(&fatal);
        assert!(matches!(outcome, Outcome::FatalFailure(_)));
        assert!(outcome.reason().unwrap().starts_with("invalid_input"));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::retryable("later")).unwrap();
        assert_eq!(json, r#"{"outcome":"retryable_failure","reason":"later"}"#);
    }
}
