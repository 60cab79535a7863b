//! Content-management service client (Payload-style REST API).

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value, json};
use tracing::instrument;

use storycrew_shared::{AdapterSettings, Result};

use crate::adapter::ServiceAdapter;
use crate::fallback;
use crate::retry::ServiceFailure;

/// Project, story, user and result records owned by the content service.
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn get_project_data(&self, project_id: &str) -> Result<Value>;

    /// The project's story document. A project without a story is a
    /// non-retryable failure.
    async fn get_story_data(&self, project_id: &str) -> Result<Value>;

    /// Set the project's workflow step, merging `extra` into the patch body.
    async fn update_status(&self, project_id: &str, step: &str, extra: &Value) -> Result<Value>;

    async fn save_results(&self, project_id: &str, pipeline_type: &str, results: &Value)
    -> Result<Value>;

    async fn get_user_preferences(&self, user_id: &str) -> Result<Value>;

    async fn health_check(&self) -> bool;
}

/// HTTP client for the content service.
#[derive(Debug, Clone)]
pub struct PayloadClient {
    adapter: ServiceAdapter,
}

impl PayloadClient {
    pub fn new(settings: &AdapterSettings) -> Result<Self> {
        Ok(Self {
            adapter: ServiceAdapter::new("content", settings)?,
        })
    }

    pub fn from_adapter(adapter: ServiceAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl ContentService for PayloadClient {
    #[instrument(skip_all, fields(project_id = %project_id))]
    async fn get_project_data(&self, project_id: &str) -> Result<Value> {
        let outcome = self
            .adapter
            .call("get_project_data", Method::GET, &["api", "projects", project_id], |r| r)
            .await;
        self.adapter
            .resolve("get_project_data", outcome, || fallback::project(project_id))
    }

    #[instrument(skip_all, fields(project_id = %project_id))]
    async fn get_story_data(&self, project_id: &str) -> Result<Value> {
        let outcome = self
            .adapter
            .call_then(
                "get_story_data",
                Method::GET,
                &["api", "stories"],
                |r| r.query(&[("where[project][equals]", project_id)]),
                |body| first_doc(body, project_id),
            )
            .await;
        self.adapter
            .resolve("get_story_data", outcome, || fallback::story(project_id))
    }

    #[instrument(skip_all, fields(project_id = %project_id, step = %step))]
    async fn update_status(&self, project_id: &str, step: &str, extra: &Value) -> Result<Value> {
        let body = status_patch(step, extra);
        let path = ["api", "projects", project_id];
        let outcome = self
            .adapter
            .call("update_status", Method::PATCH, &path, |r| r.json(&body))
            .await;
        self.adapter
            .resolve("update_status", outcome, || fallback::status_updated(project_id, step))
    }

    #[instrument(skip_all, fields(project_id = %project_id, pipeline = %pipeline_type))]
    async fn save_results(
        &self,
        project_id: &str,
        pipeline_type: &str,
        results: &Value,
    ) -> Result<Value> {
        let body = json!({
            "project": project_id,
            "crew_type": pipeline_type,
            "results": results,
        });
        let outcome = self
            .adapter
            .call("save_results", Method::POST, &["api", "crew-results"], |r| r.json(&body))
            .await;
        self.adapter.resolve("save_results", outcome, || {
            fallback::results_saved(project_id, pipeline_type)
        })
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn get_user_preferences(&self, user_id: &str) -> Result<Value> {
        let path = ["api", "users", user_id];
        let outcome = self
            .adapter
            .call_then("get_user_preferences", Method::GET, &path, |r| r, |body| {
                Ok(body
                    .get("preferences")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())))
            })
            .await;
        self.adapter.resolve("get_user_preferences", outcome, || {
            fallback::user_preferences(user_id)
        })
    }

    async fn health_check(&self) -> bool {
        self.adapter.health_check().await
    }
}

fn first_doc(body: Value, project_id: &str) -> std::result::Result<Value, ServiceFailure> {
    body.get("docs")
        .and_then(Value::as_array)
        .and_then(|docs| docs.first())
        .cloned()
        .ok_or_else(|| ServiceFailure::empty(format!("no story found for project {project_id}")))
}

fn status_patch(step: &str, extra: &Value) -> Value {
    let mut body = Map::new();
    if let Value::Object(fields) = extra {
        body.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    body.insert("workflowStatus".into(), json!({ "currentStep": step }));
    Value::Object(body)
}

/// Serves fallbacks for every call without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineContent;

#[async_trait]
impl ContentService for OfflineContent {
    async fn get_project_data(&self, project_id: &str) -> Result<Value> {
        Ok(fallback::project(project_id))
    }

    async fn get_story_data(&self, project_id: &str) -> Result<Value> {
        Ok(fallback::story(project_id))
    }

    async fn update_status(&self, project_id: &str, step: &str, _extra: &Value) -> Result<Value> {
        Ok(fallback::status_updated(project_id, step))
    }

    async fn save_results(
        &self,
        project_id: &str,
        pipeline_type: &str,
        _results: &Value,
    ) -> Result<Value> {
        Ok(fallback::results_saved(project_id, pipeline_type))
    }

    async fn get_user_preferences(&self, user_id: &str) -> Result<Value> {
        Ok(fallback::user_preferences(user_id))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
