//! Shared types, error model, and configuration for StoryCrew.
//!
//! This crate is the foundation depended on by all other StoryCrew crates.
//! It provides:
//! - [`StoryCrewError`], the unified error type
//! - Job domain types ([`Job`], [`JobStatus`], [`JobId`], [`PipelineResult`])
//! - Configuration ([`AppConfig`], [`AdapterSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AdapterSettings, AppConfig, DispatcherConfig, ExecutionMode, OpenRouterConfig, QueueConfig,
    RetentionConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{Result, StoryCrewError};
pub use types::{
    HealthReport, Job, JobConfig, JobId, JobPatch, JobStatus, JobView, PipelineResult,
    RegistryStats, StageSummary, SubmitRequest, SubmitResponse,
};
