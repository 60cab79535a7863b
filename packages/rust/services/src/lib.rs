//! External service adapters for StoryCrew.
//!
//! Pipelines talk to two collaborators: a knowledge-graph service that
//! stores and queries story graphs, and a content service that owns
//! projects, stories, users and saved results. Each client wraps a
//! [`ServiceAdapter`] that retries with bounded exponential backoff and then
//! either degrades to a deterministic fallback or fails with
//! `StoryCrewError::ServiceConnection`.

pub mod adapter;
pub mod content;
pub mod fallback;
pub mod knowledge_graph;
pub mod retry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use storycrew_shared::{AppConfig, Result};

pub use adapter::ServiceAdapter;
pub use content::{ContentService, OfflineContent, PayloadClient};
pub use knowledge_graph::{KnowledgeGraph, OfflineKnowledgeGraph, PathRagClient, QueryOptions};
pub use retry::{FailureKind, RetryPolicy, ServiceFailure, next_delay, retry};

/// Handles to every external collaborator, shared across jobs.
#[derive(Clone)]
pub struct Services {
    pub knowledge_graph: Arc<dyn KnowledgeGraph>,
    pub content: Arc<dyn ContentService>,
}

/// Result of probing each collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub knowledge_graph: bool,
    pub content: bool,
}

impl ServiceHealth {
    pub fn all_healthy(&self) -> bool {
        self.knowledge_graph && self.content
    }
}

impl Services {
    pub fn new(knowledge_graph: Arc<dyn KnowledgeGraph>, content: Arc<dyn ContentService>) -> Self {
        Self {
            knowledge_graph,
            content,
        }
    }

    /// HTTP clients built from the `[knowledge_graph]` and `[content]` sections.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(PathRagClient::new(&config.knowledge_graph)?),
            Arc::new(PayloadClient::new(&config.content)?),
        ))
    }

    /// Fallback-only services that never touch the network.
    pub fn offline() -> Self {
        Self::new(Arc::new(OfflineKnowledgeGraph), Arc::new(OfflineContent))
    }

    pub async fn health(&self) -> ServiceHealth {
        let (knowledge_graph, content) =
            tokio::join!(self.knowledge_graph.health_check(), self.content.health_check());
        ServiceHealth {
            knowledge_graph,
            content,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
