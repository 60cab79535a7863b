//! Knowledge-graph service client (PathRAG-style HTTP API).

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::instrument;

use storycrew_shared::{AdapterSettings, Result};

use crate::adapter::ServiceAdapter;
use crate::fallback;

/// Source tag attached to saved graphs.
const GRAPH_SOURCE: &str = "storycrew";

/// Retrieval options for a story query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Retrieval mode, e.g. `hybrid`, `local`, `global`.
    pub mode: String,
    pub top_k: u32,
    pub include_context: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            mode: "hybrid".into(),
            top_k: 10,
            include_context: true,
        }
    }
}

impl QueryOptions {
    pub fn hybrid(top_k: u32) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }
}

/// Stores and queries per-project story graphs.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn save_graph(&self, project_id: &str, graph: &Value) -> Result<Value>;

    async fn query_story(&self, project_id: &str, query: &str, options: &QueryOptions)
    -> Result<Value>;

    async fn health_check(&self) -> bool;
}

/// HTTP client for the knowledge-graph service.
#[derive(Debug, Clone)]
pub struct PathRagClient {
    adapter: ServiceAdapter,
}

impl PathRagClient {
    pub fn new(settings: &AdapterSettings) -> Result<Self> {
        Ok(Self {
            adapter: ServiceAdapter::new("knowledge_graph", settings)?,
        })
    }

    pub fn from_adapter(adapter: ServiceAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl KnowledgeGraph for PathRagClient {
    #[instrument(skip_all, fields(project_id = %project_id))]
    async fn save_graph(&self, project_id: &str, graph: &Value) -> Result<Value> {
        let body = json!({
            "project_id": project_id,
            "graph_data": graph,
            "metadata": {
                "source": GRAPH_SOURCE,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
        });
        let outcome = self
            .adapter
            .call("save_graph", Method::POST, &["api", "v1", "graphs"], |r| r.json(&body))
            .await;
        self.adapter
            .resolve("save_graph", outcome, || fallback::graph_saved(project_id, graph))
    }

    #[instrument(skip_all, fields(project_id = %project_id, mode = %options.mode))]
    async fn query_story(
        &self,
        project_id: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Value> {
        let body = json!({
            "project_id": project_id,
            "query": query,
            "options": {
                "mode": options.mode,
                "max_results": options.top_k,
                "include_context": options.include_context,
            },
        });
        let outcome = self
            .adapter
            .call("query_story", Method::POST, &["api", "v1", "query"], |r| r.json(&body))
            .await;
        self.adapter
            .resolve("query_story", outcome, || fallback::query_results(project_id, query))
    }

    async fn health_check(&self) -> bool {
        self.adapter.health_check().await
    }
}

/// Serves fallbacks for every call without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineKnowledgeGraph;

#[async_trait]
impl KnowledgeGraph for OfflineKnowledgeGraph {
    async fn save_graph(&self, project_id: &str, graph: &Value) -> Result<Value> {
        Ok(fallback::graph_saved(project_id, graph))
    }

    async fn query_story(
        &self,
        project_id: &str,
        query: &str,
        _options: &QueryOptions,
    ) -> Result<Value> {
        Ok(fallback::query_results(project_id, query))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
