//! Pipelines: an ordered list of stage workers plus input enrichment and
//! result shaping.
//!
//! A [`Pipeline`] is built per job for one project, user and job config.
//! [`Pipeline::execute`] runs `preprocess`, every stage in order (fail-fast),
//! and `postprocess`, returning a [`PipelineResult`] or an error. The
//! dispatcher owns all job state transitions.

mod architect;
mod director;
pub mod executor;
pub mod stage;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use storycrew_services::Services;
use storycrew_shared::{JobConfig, PipelineResult, Result, StageSummary, StoryCrewError};

use crate::catalog::PipelineKind;

pub use executor::{
    OfflineExecutor, OpenRouterExecutor, StageExecutor, StageRequest, executor_from_config,
};
pub use stage::{Capability, StageOutput, StageRole, StageWorker};

/// Default character limit for result summaries.
pub const DEFAULT_SUMMARY_LIMIT: usize = 500;

/// Character limit for per-stage excerpts in a result.
const STAGE_EXCERPT_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Progress callback for stage execution.
pub trait StageProgress: Send + Sync {
    /// Called before a stage runs. `index` is 0-based.
    fn stage_started(&self, role: StageRole, index: usize, total: usize);
    /// Called after a stage produced output.
    fn stage_finished(&self, role: StageRole, index: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl StageProgress for SilentProgress {
    fn stage_started(&self, _role: StageRole, _index: usize, _total: usize) {}
    fn stage_finished(&self, _role: StageRole, _index: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One runnable pipeline instance.
pub struct Pipeline {
    kind: PipelineKind,
    project_id: String,
    user_id: String,
    config: JobConfig,
    services: Services,
    executor: Arc<dyn StageExecutor>,
    summary_limit: usize,
    workers: Vec<StageWorker>,
}

impl Pipeline {
    pub fn build(
        kind: PipelineKind,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        config: JobConfig,
        services: Services,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            kind,
            project_id: project_id.into(),
            user_id: user_id.into(),
            config,
            services,
            executor,
            summary_limit: DEFAULT_SUMMARY_LIMIT,
            workers: kind.stages().iter().copied().map(StageWorker::new).collect(),
        }
    }

    pub fn with_summary_limit(mut self, limit: usize) -> Self {
        self.summary_limit = limit.max(1);
        self
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn workers(&self) -> &[StageWorker] {
        &self.workers
    }

    /// Run the whole pipeline on raw job input.
    #[instrument(skip_all, fields(pipeline = %self.kind, project_id = %self.project_id))]
    pub async fn execute(
        &self,
        input: &Value,
        progress: &dyn StageProgress,
    ) -> Result<PipelineResult> {
        let start = Instant::now();
        let enriched = self.preprocess(input).await;
        let outputs = self.run_stages(&enriched, progress).await?;
        let mut result = self.postprocess(&outputs);
        result.execution_ms = start.elapsed().as_millis() as u64;

        info!(
            success = result.success,
            stages = outputs.len(),
            elapsed_ms = result.execution_ms,
            "pipeline finished"
        );
        Ok(result)
    }

    /// Enrich raw input with project, story and user context. Adapter
    /// failures degrade to empty objects; this never fails.
    pub async fn preprocess(&self, input: &Value) -> Value {
        match self.kind {
            PipelineKind::Architect => architect::preprocess(self, input).await,
            PipelineKind::Director => director::preprocess(self, input).await,
        }
    }

    /// Run every stage in order, stopping at the first failure.
    pub async fn run_stages(
        &self,
        enriched: &Value,
        progress: &dyn StageProgress,
    ) -> Result<Vec<StageOutput>> {
        let total = self.workers.len();
        let mut outputs: Vec<StageOutput> = Vec::with_capacity(total);

        for (index, worker) in self.workers.iter().enumerate() {
            progress.stage_started(worker.role, index, total);
            let output = self.run_stage(worker, enriched, &outputs).await?;
            outputs.push(output);
            progress.stage_finished(worker.role, index, total);
        }
        Ok(outputs)
    }

    #[instrument(skip_all, fields(role = %worker.role))]
    async fn run_stage(
        &self,
        worker: &StageWorker,
        enriched: &Value,
        prior: &[StageOutput],
    ) -> Result<StageOutput> {
        let tools = match self.kind {
            PipelineKind::Architect => architect::before_stage(self, worker, prior).await?,
            PipelineKind::Director => director::before_stage(self, worker, prior).await?,
        };

        let mut request = StageRequest {
            role: worker.role,
            project_id: self.project_id.clone(),
            context: json!({
                "input": enriched,
                "prior": prior
                    .iter()
                    .map(|o| json!({"role": o.role, "text": o.text}))
                    .collect::<Vec<_>>(),
                "tools": tools,
            }),
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            attempt: 1,
        };

        let max_iter = self.config.max_iter();
        let text = loop {
            let text = self.executor.execute(&request).await?;
            if !text.trim().is_empty() {
                break text;
            }
            if request.attempt >= max_iter {
                return Err(StoryCrewError::pipeline(format!(
                    "stage {} produced no output after {max_iter} attempt(s)",
                    worker.role
                )));
            }
            warn!(attempt = request.attempt, "stage returned empty output, re-prompting");
            request.attempt += 1;
        };
        if self.config.is_verbose() {
            info!(
                executor = self.executor.name(),
                chars = text.chars().count(),
                "stage output received"
            );
        } else {
            debug!(executor = self.executor.name(), "stage output received");
        }

        let artifacts = match self.kind {
            PipelineKind::Architect => architect::after_stage(self, worker, prior, &text).await?,
            PipelineKind::Director => director::after_stage(self, worker, prior, &text).await?,
        };

        Ok(StageOutput {
            role: worker.role,
            text,
            artifacts,
        })
    }

    /// Shape stage outputs into a result. Malformed output becomes a
    /// structured failure rather than an error.
    pub fn postprocess(&self, outputs: &[StageOutput]) -> PipelineResult {
        let phase = self.kind.as_str();
        if outputs.len() != self.workers.len() {
            return PipelineResult::failure(
                phase,
                &self.project_id,
                format!(
                    "expected {} stage output(s), got {}",
                    self.workers.len(),
                    outputs.len()
                ),
            );
        }
        let Some(last) = outputs.last().filter(|o| !o.text.trim().is_empty()) else {
            return PipelineResult::failure(
                phase,
                &self.project_id,
                "final stage produced no output",
            );
        };

        let (recommendations, deliverables) = match self.kind {
            PipelineKind::Architect => (architect::recommendations(), None),
            PipelineKind::Director => (director::recommendations(), Some(director::deliverables())),
        };

        PipelineResult {
            summary: Some(truncate_summary(&last.text, self.summary_limit)),
            next_phase: Some(self.kind.next_phase().to_string()),
            recommendations: Some(recommendations),
            deliverables,
            stages: outputs
                .iter()
                .map(|o| StageSummary {
                    role: o.role.to_string(),
                    excerpt: truncate_summary(&o.text, STAGE_EXCERPT_CHARS),
                })
                .collect(),
            ..PipelineResult::success(phase, &self.project_id, last.text.as_str())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// First `limit` characters plus `...` when longer. Never splits a character.
pub fn truncate_summary(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// A JSON object embedded in free text, if any.
pub(crate) fn embedded_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Unwrap an adapter result during preprocessing, substituting `{}`.
pub(crate) fn or_empty(result: Result<Value>, operation: &str) -> Value {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(operation, error = %e, "context lookup failed, continuing without it");
            Value::Object(Map::new())
        }
    }
}

/// `input[key]` when present and not null, else `default`.
pub(crate) fn input_or(input: &Value, key: &str, default: Value) -> Value {
    match input.get(key) {
        Some(value) if !value.is_null() => value.clone(),
        _ => default,
    }
}
