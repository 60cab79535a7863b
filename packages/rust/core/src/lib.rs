//! Job orchestration for StoryCrew.
//!
//! This crate ties the job registry, the pipeline catalog, the stage
//! pipelines and the optional durable queue together behind a
//! [`Dispatcher`] that accepts submissions and runs them in the background.

pub mod catalog;
pub mod dispatcher;
pub mod pipeline;
pub mod registry;
pub mod retention;

pub use catalog::{PipelineCatalog, PipelineKind};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use pipeline::{
    OfflineExecutor, OpenRouterExecutor, Pipeline, SilentProgress, StageExecutor, StageProgress,
    executor_from_config,
};
pub use registry::JobRegistry;
pub use retention::RetentionPolicy;
