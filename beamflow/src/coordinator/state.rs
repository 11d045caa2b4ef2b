//! Forward-only pipeline state.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

use crate::errors::BeamflowError;

/// Where one task attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    /// Delivery turned into a task.
    Received,
    /// Source blob downloaded into the workdir.
    Fetched,
    /// Stage `n` (1-based) completed.
    StageDone(usize),
    /// Handoff sentinel posted. Last producer state.
    SentinelPosted,
    /// Artifacts uploaded by the watcher.
    Uploaded,
    /// Workdir removed. Terminal.
    Cleaned,
    /// Attempt dropped after a fatal failure. Terminal.
    Abandoned,
}

impl PipelineState {
    fn rank(self) -> usize {
        match self {
            Self::Received => 0,
            Self::Fetched => 1,
            Self::StageDone(n) => 1 + n,
            // Above any realistic stage count.
            Self::SentinelPosted => usize::MAX - 3,
            Self::Uploaded => usize::MAX - 2,
            Self::Cleaned => usize::MAX - 1,
            Self::Abandoned => usize::MAX,
        }
    }

    /// Returns true for states that accept no further transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cleaned | Self::Abandoned)
    }

    /// Returns true if moving from `self` to `next` is allowed.
    ///
    /// Every non-terminal state may be abandoned. Otherwise the state only
    /// moves forward and stages complete one at a time.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Abandoned) => true,
            (Self::Fetched, Self::StageDone(n)) => n == 1,
            (Self::StageDone(m), Self::StageDone(n)) => n == m + 1,
            (Self::Received, Self::StageDone(_)) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Fetched => write!(f, "fetched"),
            Self::StageDone(n) => write!(f, "stage_done({n})"),
            Self::SentinelPosted => write!(f, "sentinel_posted"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::Cleaned => write!(f, "cleaned"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Records the states one task attempt passes through.
#[derive(Debug, Clone)]
pub struct StateTracker {
    task: String,
    history: Vec<PipelineState>,
}

impl StateTracker {
    /// Starts a producer attempt in [`PipelineState::Received`].
    #[must_use]
    pub fn received(task: impl Into<String>) -> Self {
        Self::starting_at(task, PipelineState::Received)
    }

    /// Starts tracking at an arbitrary state, e.g. the watcher's
    /// [`PipelineState::SentinelPosted`].
    #[must_use]
    pub fn starting_at(task: impl Into<String>, state: PipelineState) -> Self {
        Self {
            task: task.into(),
            history: vec![state],
        }
    }

    /// The current state.
    #[must_use]
    pub fn current(&self) -> PipelineState {
        self.history
            .last()
            .copied()
            .unwrap_or(PipelineState::Received)
    }

    /// Every state visited, oldest first.
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Moves to `next`, rejecting backward moves.
    pub fn advance(&mut self, next: PipelineState) -> Result<(), BeamflowError> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(BeamflowError::InvalidTransition {
                task: self.task.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        trace!(task = %self.task, from = %current, to = %next, "State transition");
        self.history.push(next);
        Ok(())
    }

    /// Marks the attempt abandoned unless it already ended.
    pub fn abandon(&mut self) {
        if !self.current().is_terminal() {
            self.history.push(PipelineState::Abandoned);
        }
    }
}
