//! Stage timing and span attributes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::core::StageResult;

/// Structured attributes recorded for one stage run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// `command` or `render`.
    pub stage_kind: Option<String>,
    /// Task key.
    pub task: Option<String>,
    /// `ok` or `failed`.
    pub status: Option<String>,
    /// Wall time in milliseconds.
    pub duration_ms: Option<f64>,
    /// Failure detail.
    pub error: Option<String>,
    /// Output files produced.
    pub produced: Vec<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for `stage_name`.
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            ..Default::default()
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.stage_kind = Some(kind.into());
        self
    }

    /// Sets the task key.
    #[must_use]
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Fills status, error and outputs from a finished stage.
    #[must_use]
    pub fn with_result(mut self, result: &StageResult, duration_ms: f64) -> Self {
        self.status = Some(result.status.to_string());
        self.duration_ms = Some(duration_ms);
        self.error.clone_from(&result.exit_detail);
        self.produced = result
            .produced_refs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        self
    }

    /// Flattens into dotted keys, as emitted with `stage.*` events.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("stage.name".to_string(), self.stage_name.clone());
        if let Some(ref v) = self.stage_kind {
            attrs.insert("stage.kind".to_string(), v.clone());
        }
        if let Some(ref v) = self.task {
            attrs.insert("stage.task".to_string(), v.clone());
        }
        if let Some(ref v) = self.status {
            attrs.insert("stage.status".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("stage.duration_ms".to_string(), format!("{v:.1}"));
        }
        if let Some(ref v) = self.error {
            attrs.insert("stage.error".to_string(), v.clone());
        }
        if !self.produced.is_empty() {
            attrs.insert("stage.produced".to_string(), self.produced.join(","));
        }
        attrs
    }
}

/// Wall-clock timer for a named span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts timing.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Milliseconds since start.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer and returns the elapsed milliseconds.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
