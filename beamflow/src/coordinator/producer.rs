//! Producer role: fetch, run stages, post the handoff sentinel.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::{PipelineState, StateTracker};
use super::workdir::TaskWorkdir;
use crate::config::BeamflowConfig;
use crate::core::{Outcome, StageResult, Task};
use crate::errors::{BeamflowError, RenderError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::observability::{SpanTimer, StageSpanAttributes};
use crate::queue::TaskHandler;
use crate::render::RenderInvoker;
use crate::sentinel::SentinelStore;
use crate::stages::{RenderStage, StageDefinition, StageRunner, TemplateVars};
use crate::storage::ObjectStoreClient;

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Root of task working directories.
    pub work_root: PathBuf,
    /// Key prefix of uploaded results, used by the completed-task check.
    pub results_prefix: String,
    /// Ack tasks whose `.glb` result already exists.
    pub skip_completed: bool,
    /// Prefix of the handoff sentinel.
    pub sentinel_prefix: String,
}

impl ProducerSettings {
    /// Settings with the default results prefix and sentinel prefix.
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            results_prefix: "dg-results".to_string(),
            skip_completed: true,
            sentinel_prefix: "ready:".to_string(),
        }
    }

    /// Settings taken from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &BeamflowConfig) -> Self {
        Self {
            work_root: config.work_root.clone(),
            results_prefix: config.storage.results_prefix.clone(),
            skip_completed: config.storage.skip_completed,
            sentinel_prefix: config.sentinel.prefix.clone(),
        }
    }
}

/// What one producer attempt did.
#[derive(Debug, Clone)]
pub struct ProducerReport {
    /// States visited.
    pub states: Vec<PipelineState>,
    /// One entry per stage run.
    pub stage_results: Vec<StageResult>,
    /// Set when the task was acked without rework.
    pub skipped: Option<SkipReason>,
}

/// Why an attempt skipped all work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The result object already exists.
    AlreadyCompleted,
    /// A previous attempt posted the sentinel and no watcher has finished
    /// uploading from the workdir yet.
    HandoffPending,
}

/// Runs the producer half of the pipeline for each task.
pub struct Producer {
    store: Arc<dyn ObjectStoreClient>,
    sentinels: Arc<dyn SentinelStore>,
    render: Option<Arc<dyn RenderInvoker>>,
    runner: StageRunner,
    stages: Vec<StageDefinition>,
    settings: ProducerSettings,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("stages", &self.stages)
            .field("settings", &self.settings)
            .field("render", &self.render.is_some())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Creates a producer.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        sentinels: Arc<dyn SentinelStore>,
        stages: Vec<StageDefinition>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            store,
            sentinels,
            render: None,
            runner: StageRunner::new(),
            stages,
            settings,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the invoker used by render stages.
    #[must_use]
    pub fn with_render_invoker(mut self, render: Arc<dyn RenderInvoker>) -> Self {
        self.render = Some(render);
        self
    }

    /// Sets the subprocess runner.
    #[must_use]
    pub fn with_runner(mut self, runner: StageRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Runs one attempt of `task`.
    ///
    /// On success the sentinel is posted and the function returns without
    /// waiting for the watcher.
    pub async fn run(&self, task: &Task) -> Result<ProducerReport, BeamflowError> {
        let mut tracker = StateTracker::received(task.key());
        let mut stage_results = Vec::with_capacity(self.stages.len());

        if let Some(reason) = self.skip_reason(task).await? {
            info!(?reason, "Skipping task, nothing to do");
            return Ok(ProducerReport {
                states: tracker.history().to_vec(),
                stage_results,
                skipped: Some(reason),
            });
        }

        let result = self.run_stages(task, &mut tracker, &mut stage_results).await;
        if let Err(err) = result {
            if !err.classify().is_retryable() {
                tracker.abandon();
                // Nothing will come back for this workdir.
                if let Ok(workdir) = TaskWorkdir::locate(&self.settings.work_root, task.key()) {
                    if let Err(e) = workdir.remove().await {
                        warn!(error = %e, "Failed to remove workdir of abandoned task");
                    }
                }
            }
            return Err(err);
        }

        Ok(ProducerReport {
            states: tracker.history().to_vec(),
            stage_results,
            skipped: None,
        })
    }

    async fn skip_reason(&self, task: &Task) -> Result<Option<SkipReason>, BeamflowError> {
        let sentinel = task.sentinel_name(&self.settings.sentinel_prefix);
        if self.sentinels.pending(&sentinel).await?.contains(&sentinel) {
            return Ok(Some(SkipReason::HandoffPending));
        }
        // A claimed sentinel means a watcher is reading this workdir.
        if self
            .sentinels
            .claimed(&sentinel)
            .await?
            .iter()
            .any(|claim| claim.name == sentinel)
        {
            return Ok(Some(SkipReason::HandoffPending));
        }

        if self.settings.skip_completed {
            let result_key = format!(
                "{}/{}.glb",
                self.settings.results_prefix.trim_matches('/'),
                task.key()
            );
            if self.store.list(&result_key).await?.contains(&result_key) {
                return Ok(Some(SkipReason::AlreadyCompleted));
            }
        }
        Ok(None)
    }

    async fn run_stages(
        &self,
        task: &Task,
        tracker: &mut StateTracker,
        stage_results: &mut Vec<StageResult>,
    ) -> Result<(), BeamflowError> {
        let workdir = TaskWorkdir::prepare(&self.settings.work_root, task.key()).await?;
        let input = workdir.input_path(&task.filename);
        self.store.download(&task.source_blob_ref, &input).await?;
        tracker.advance(PipelineState::Fetched)?;
        debug!(input = %input.display(), "Source fetched");

        let mut vars = TemplateVars {
            input,
            stem: task.key().to_string(),
            workdir: workdir.path().to_path_buf(),
            output_dir: workdir.output_dir(),
        };

        for (index, stage) in self.stages.iter().enumerate() {
            let timer = SpanTimer::start(stage.name());
            let result = match stage {
                StageDefinition::Command(command) => {
                    let (spec, args) = command.resolve(&vars);
                    self.runner.run(&spec, &args).await
                }
                StageDefinition::Render(render) => {
                    let started_at = Utc::now();
                    match self.run_render(render, &vars).await {
                        Ok(output) => StageResult::ok(&render.name, started_at, vec![output]),
                        Err(err) => {
                            let failed = StageResult::failed(&render.name, started_at, err.to_string());
                            self.stage_event(task, stage, &failed, timer.finish()).await;
                            stage_results.push(failed);
                            return Err(err);
                        }
                    }
                }
            };
            self.stage_event(task, stage, &result, timer.finish()).await;

            if !result.is_success() {
                let detail = result.exit_detail.clone().unwrap_or_default();
                stage_results.push(result);
                return Err(BeamflowError::stage_execution(stage.name(), detail));
            }

            if let Some(next_input) = result.produced_refs.first() {
                vars = vars.with_input(next_input.clone());
            }
            stage_results.push(result);
            tracker.advance(PipelineState::StageDone(index + 1))?;
        }

        let sentinel = task.sentinel_name(&self.settings.sentinel_prefix);
        self.sentinels.post(&sentinel).await?;
        tracker.advance(PipelineState::SentinelPosted)?;
        self.events
            .emit(names::SENTINEL_POSTED, Some(json!({ "task": task.key(), "sentinel": &sentinel })))
            .await;
        info!(sentinel = %sentinel, "Stages complete, handoff posted");
        Ok(())
    }

    async fn run_render(&self, stage: &RenderStage, vars: &TemplateVars) -> Result<PathBuf, BeamflowError> {
        let invoker = self.render.as_ref().ok_or(RenderError::NotConfigured)?;

        let image = tokio::fs::read(&vars.input).await?;
        let asset = invoker.invoke(image).await?;

        let output = vars.render_path(&stage.produces);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&output, &asset).await?;
        debug!(stage = %stage.name, output = %output.display(), size = asset.len(), "Render output written");

        Ok(output)
    }

    async fn stage_event(&self, task: &Task, stage: &StageDefinition, result: &StageResult, duration_ms: f64) {
        let attributes = StageSpanAttributes::new(stage.name())
            .with_kind(stage.kind())
            .with_task(task.key())
            .with_result(result, duration_ms);
        let event = if result.is_success() {
            names::STAGE_COMPLETED
        } else {
            warn!(stage = stage.name(), detail = result.exit_detail.as_deref().unwrap_or(""), "Stage failed");
            names::STAGE_FAILED
        };
        self.events
            .emit(event, serde_json::to_value(attributes.to_attributes()).ok())
            .await;
    }
}

#[async_trait]
impl TaskHandler for Producer {
    async fn handle(&self, task: &Task) -> Outcome {
        match self.run(task).await {
            Ok(_) => Outcome::Success,
            Err(err) => Outcome::from_error(&err),
        }
    }
}
