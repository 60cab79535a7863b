//! Core domain types for StoryCrew jobs and pipeline results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoryCrewError};

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Opaque job identifier, derived from pipeline type, project and creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive an ID as `<pipeline>_<project>_<unix-millis>_<sequence>`.
    ///
    /// `sequence` disambiguates submissions that share a millisecond.
    pub fn derive(
        pipeline_type: &str,
        project_id: &str,
        created_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self(format!(
            "{pipeline_type}_{project_id}_{}_{sequence}",
            created_at.timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Job lifecycle status: `queued -> running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoryCrewError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoryCrewError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobConfig
// ---------------------------------------------------------------------------

/// Per-job overrides. Recognized keys are typed; everything else is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// LLM model override for stage execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Verbose stage logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,

    /// Sampling temperature, 0.0 to 2.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum executor iterations per stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iter: Option<u32>,

    /// Unrecognized keys, passed through opaquely.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobConfig {
    /// Default number of executor iterations per stage.
    pub const DEFAULT_MAX_ITER: u32 = 3;

    /// Reject out-of-range values for recognized keys.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(StoryCrewError::validation(format!(
                    "temperature must be between 0.0 and 2.0, got {t}"
                )));
            }
        }
        if self.max_iter == Some(0) {
            return Err(StoryCrewError::validation("max_iter must be at least 1"));
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(StoryCrewError::validation("model must not be empty"));
            }
        }
        Ok(())
    }

    pub fn max_iter(&self) -> u32 {
        self.max_iter.unwrap_or(Self::DEFAULT_MAX_ITER)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// PipelineResult
// ---------------------------------------------------------------------------

/// Per-stage excerpt carried in a pipeline result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub role: String,
    pub excerpt: String,
}

/// Structured output of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Which pipeline produced this result.
    pub phase: String,
    pub project_id: String,
    /// Bounded human-readable excerpt of `full_result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Uncut final stage output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_result: Option<String>,
    /// Pipeline a caller should chain next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverables: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_ms: u64,
}

impl PipelineResult {
    /// Successful result whose summary is the full text.
    pub fn success(
        phase: impl Into<String>,
        project_id: impl Into<String>,
        full_result: impl Into<String>,
    ) -> Self {
        let full_result = full_result.into();
        Self {
            success: true,
            phase: phase.into(),
            project_id: project_id.into(),
            summary: Some(full_result.clone()),
            full_result: Some(full_result),
            next_phase: None,
            recommendations: None,
            deliverables: None,
            stages: Vec::new(),
            error: None,
            execution_ms: 0,
        }
    }

    /// Structured failure: no summary, no next phase.
    pub fn failure(
        phase: impl Into<String>,
        project_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            phase: phase.into(),
            project_id: project_id.into(),
            summary: None,
            full_result: None,
            next_phase: None,
            recommendations: None,
            deliverables: None,
            stages: Vec::new(),
            error: Some(error.into()),
            execution_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Fields merged into a job alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn completed(result: PipelineResult, at: DateTime<Utc>) -> Self {
        Self {
            result: Some(result),
            progress: Some(100),
            completed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error: Some(error.into()),
            completed_at: Some(at),
            ..Default::default()
        }
    }
}

/// One tracked execution request for a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_type: String,
    pub project_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub config: JobConfig,
}

impl Job {
    /// A freshly submitted job in `queued` state.
    pub fn queued(id: JobId, request: &SubmitRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            pipeline_type: request.pipeline_type.clone(),
            project_id: request.project_id.clone(),
            user_id: request.user_id.clone(),
            status: JobStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            progress: 0,
            input_data: request.input_data.clone(),
            result: None,
            error: None,
            config: request.config.clone(),
        }
    }

    /// Apply a status change and merge `patch`, enforcing the state machine
    /// and the terminal result/error invariant. On error the job is unchanged.
    pub fn transition(&mut self, status: JobStatus, patch: JobPatch) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(StoryCrewError::InvalidTransition {
                job_id: self.id.to_string(),
                from: self.status,
                to: status,
            });
        }
        match status {
            JobStatus::Completed if patch.result.is_none() => {
                return Err(StoryCrewError::validation(
                    "completed transition requires a result",
                ));
            }
            JobStatus::Failed if patch.error.is_none() => {
                return Err(StoryCrewError::validation(
                    "failed transition requires an error",
                ));
            }
            _ => {}
        }

        self.status = status;
        if let Some(at) = patch.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(progress) = patch.progress {
            self.raise_progress(progress);
        }
        match status {
            JobStatus::Completed => {
                self.result = patch.result;
                self.error = None;
            }
            JobStatus::Failed => {
                self.error = patch.error;
                self.result = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Progress never moves backwards and never exceeds 100.
    pub fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id.clone(),
            status: self.status,
            pipeline_type: self.pipeline_type.clone(),
            project_id: self.project_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Control-plane payloads
// ---------------------------------------------------------------------------

/// A request to run a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub pipeline_type: String,
    pub project_id: String,
    pub user_id: String,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default)]
    pub config: JobConfig,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl SubmitRequest {
    pub fn new(
        pipeline_type: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        input_data: Value,
    ) -> Self {
        Self {
            pipeline_type: pipeline_type.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            input_data,
            config: JobConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    /// Field-level checks that do not depend on which pipelines are registered.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("pipeline_type", &self.pipeline_type),
            ("project_id", &self.project_id),
            ("user_id", &self.user_id),
        ] {
            if value.trim().is_empty() {
                return Err(StoryCrewError::validation(format!(
                    "{name} must not be empty"
                )));
            }
        }
        // Both ids end up as URL path segments on the content service.
        for (name, value) in [("project_id", &self.project_id), ("user_id", &self.user_id)] {
            if value == "." || value == ".." || value.contains(['/', '?', '#']) {
                return Err(StoryCrewError::validation(format!(
                    "{name} must be a single path segment, got {value:?}"
                )));
            }
        }
        if !self.input_data.is_object() {
            return Err(StoryCrewError::validation("input_data must be a JSON object"));
        }
        self.config.validate()
    }
}

/// Response to a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitResponse {
    pub fn accepted(job_id: &JobId, pipeline_type: &str) -> Self {
        Self {
            success: true,
            job_id: job_id.to_string(),
            message: Some(format!("pipeline {pipeline_type} queued successfully")),
            error: None,
        }
    }

    pub fn rejected(error: &StoryCrewError) -> Self {
        Self {
            success: false,
            job_id: String::new(),
            message: None,
            error: Some(error.to_string()),
        }
    }
}

/// Read-only view of a job returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub pipeline_type: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate job counts by current status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Jobs currently running.
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
}
