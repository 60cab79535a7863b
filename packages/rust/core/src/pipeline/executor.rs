//! Stage executors: turn a stage request into text.
//!
//! [`OpenRouterExecutor`] calls an OpenAI-compatible chat-completions API.
//! [`OfflineExecutor`] derives deterministic text from the request and is
//! used when no API key is configured, and in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use storycrew_services::{FailureKind, RetryPolicy, ServiceFailure, retry};
use storycrew_shared::{OpenRouterConfig, Result, StoryCrewError, resolve_api_key};

use super::stage::StageRole;

/// User-Agent string for LLM requests.
const USER_AGENT: &str = concat!("StoryCrew/", env!("CARGO_PKG_VERSION"));

/// LLM calls are slow; give each attempt generous headroom.
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Maximum story entities the offline executor extracts.
const MAX_OFFLINE_ENTITIES: usize = 12;

/// Everything an executor needs to run one stage.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub role: StageRole,
    pub project_id: String,
    /// Enriched input, prior stage outputs and tool results.
    pub context: Value,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    /// 1-based attempt number; above 1 the previous answer was empty.
    pub attempt: u32,
}

impl StageRequest {
    pub fn system_prompt(&self) -> String {
        format!("You are the {}. Your goal: {}.", self.role.title(), self.role.goal())
    }

    pub fn user_prompt(&self) -> String {
        let context = serde_json::to_string_pretty(&self.context).unwrap_or_default();
        let mut prompt = format!(
            "{}\n\nProject ID: {}\n\nContext:\n{context}",
            self.role.task(),
            self.project_id
        );
        if self.attempt > 1 {
            prompt.push_str("\n\nYour previous answer was empty. Provide a complete answer.");
        }
        prompt
    }
}

/// Runs a single stage request.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn execute(&self, request: &StageRequest) -> Result<String>;
}

/// Pick the OpenRouter executor when its API key is set, otherwise offline.
pub fn executor_from_config(config: &OpenRouterConfig) -> Result<Arc<dyn StageExecutor>> {
    match resolve_api_key(&config.api_key_env) {
        Some(key) => Ok(Arc::new(OpenRouterExecutor::new(config, key)?)),
        None => {
            info!(
                env = %config.api_key_env,
                "no LLM API key configured, using offline stage executor"
            );
            Ok(Arc::new(OfflineExecutor))
        }
    }
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

/// Chat-completions executor.
pub struct OpenRouterExecutor {
    client: Client,
    endpoint: String,
    api_key: String,
    default_model: String,
    default_temperature: f64,
    policy: RetryPolicy,
}

impl OpenRouterExecutor {
    pub fn new(config: &OpenRouterConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoryCrewError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            default_model: config.default_model.clone(),
            default_temperature: config.temperature,
            policy: RetryPolicy {
                max_attempts: 2,
                ..Default::default()
            },
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn complete_once(&self, body: &Value) -> std::result::Result<String, ServiceFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceFailure::new(
                FailureKind::Status(status.as_u16()),
                format!("openrouter: HTTP {status}"),
            ));
        }

        let payload: Value = response.json().await?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceFailure::new(
                    FailureKind::Decode,
                    "openrouter: response has no message content",
                )
            })
    }
}

#[async_trait]
impl StageExecutor for OpenRouterExecutor {
    fn name(&self) -> &str {
        "openrouter"
    }

    #[instrument(skip_all, fields(role = %request.role, attempt = request.attempt))]
    async fn execute(&self, request: &StageRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let body = json!({
            "model": model,
            "temperature": request.temperature.unwrap_or(self.default_temperature),
            "messages": [
                {"role": "system", "content": request.system_prompt()},
                {"role": "user", "content": request.user_prompt()},
            ],
        });
        debug!(%model, "requesting completion");

        let body = &body;
        retry("openrouter", request.role.as_str(), &self.policy, || async move {
            self.complete_once(body).await
        })
        .await
        .map_err(|failure| {
            StoryCrewError::pipeline(format!("stage {} execution failed: {failure}", request.role))
        })
    }
}

// ---------------------------------------------------------------------------
// Offline
// ---------------------------------------------------------------------------

/// Deterministic executor: same request, same text.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineExecutor;

#[async_trait]
impl StageExecutor for OfflineExecutor {
    fn name(&self) -> &str {
        "offline"
    }

    async fn execute(&self, request: &StageRequest) -> Result<String> {
        Ok(offline_text(request))
    }
}

fn offline_text(request: &StageRequest) -> String {
    let input = &request.context["input"];
    let header = format!(
        "{} report for project {}",
        request.role.title(),
        request.project_id
    );

    match request.role {
        StageRole::StoryParser => {
            let story = input["story_text"].as_str().unwrap_or_default();
            let entities = story_entities(story);
            let relationships: Vec<Value> = entities
                .windows(2)
                .map(|pair| json!({"source": pair[0], "target": pair[1], "type": "appears_with"}))
                .collect();
            let graph = json!({
                "entities": entities
                    .iter()
                    .map(|name| json!({"name": name, "type": "character"}))
                    .collect::<Vec<_>>(),
                "relationships": relationships,
            });
            format!(
                "{header}\n{graph}\nSummary: {} words analyzed, {} entities identified.",
                story.split_whitespace().count(),
                entities.len()
            )
        }
        StageRole::GraphBuilder => {
            let prior = prior_count(request);
            format!(
                "{header}\nKnowledge graph assembled from {prior} prior stage output(s). \
                 Entities and relationships validated and stored."
            )
        }
        StageRole::SceneAnalyzer => {
            let selection = input["scene_selection"].as_str().unwrap_or("all");
            let style = input["director_preferences"]["style"]
                .as_str()
                .unwrap_or("cinematic");
            format!(
                "{header}\nScene selection: {selection}\nStyle: {style}\n\
                 Scene 1: establishing beat, slow push-in, low-key lighting.\n\
                 Scene 2: confrontation, handheld coverage, rising tension."
            )
        }
        StageRole::ShotGenerator => {
            let budget = input["production_constraints"]["budget"]
                .as_str()
                .unwrap_or("medium");
            format!(
                "{header}\nBudget: {budget}\n\
                 Shot 1A: wide establishing, 24mm, dolly in, practical lighting.\n\
                 Shot 1B: medium close-up, 50mm, static, soft key.\n\
                 Shot 2A: over-the-shoulder, 85mm, handheld, hard side light."
            )
        }
    }
}

fn prior_count(request: &StageRequest) -> usize {
    request.context["prior"].as_array().map(Vec::len).unwrap_or(0)
}

/// Capitalized words that are not common sentence starters, in order of
/// first appearance.
fn story_entities(story: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "A", "An", "And", "As", "At", "But", "He", "Her", "His", "I", "In", "It", "Once", "She",
        "The", "Then", "They", "We", "When", "You",
    ];
    let mut seen = Vec::new();
    for word in story.split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        let capitalized = word.chars().next().is_some_and(char::is_uppercase);
        if capitalized
            && word.chars().count() > 1
            && !STOPWORDS.contains(&word)
            && !seen.iter().any(|s: &String| s == word)
        {
            seen.push(word.to_string());
            if seen.len() == MAX_OFFLINE_ENTITIES {
                break;
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(role: StageRole, context: Value) -> StageRequest {
        StageRequest {
            role,
            project_id: "p1".into(),
            context,
            model: None,
            temperature: None,
            attempt: 1,
        }
    }

    #[test]
    fn story_entities_skip_stopwords_and_duplicates() {
        let entities = story_entities("Once Sarah met Marcus. The theatre was dark. Sarah ran.");
        assert_eq!(entities, ["Sarah", "Marcus"]);
    }

    #[tokio::test]
    async fn offline_is_deterministic() {
        let req = request(
            StageRole::StoryParser,
            json!({"input": {"story_text": "Sarah enters the Theatre."}}),
        );
        let a = OfflineExecutor.execute(&req).await.unwrap();
        let b = OfflineExecutor.execute(&req).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("\"Sarah\""));
        assert!(a.contains("\"Theatre\""));
    }

    #[test]
    fn retry_prompt_mentions_empty_answer() {
        let mut req = request(StageRole::SceneAnalyzer, json!({}));
        assert!(!req.user_prompt().contains("previous answer"));
        req.attempt = 2;
        assert!(req.user_prompt().contains("previous answer was empty"));
        assert!(req.system_prompt().contains("Scene Analysis Director"));
    }

    fn openrouter(server: &MockServer) -> OpenRouterExecutor {
        let config = OpenRouterConfig {
            base_url: format!("{}/api/v1", server.uri()),
            ..Default::default()
        };
        OpenRouterExecutor::new(&config, "sk-test".into())
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
            })
    }

    #[tokio::test]
    async fn openrouter_uses_job_model_override() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "openai/gpt-4o", "temperature": 0.2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Scene 1: ..."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(StageRole::SceneAnalyzer, json!({}));
        req.model = Some("openai/gpt-4o".into());
        req.temperature = Some(0.2);
        let text = openrouter(&server).execute(&req).await.unwrap();
        assert_eq!(text, "Scene 1: ...");
    }

    #[tokio::test]
    async fn openrouter_failure_is_pipeline_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let err = openrouter(&server)
            .execute(&request(StageRole::ShotGenerator, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryCrewError::PipelineExecution(_)));
        assert!(err.to_string().contains("shot_generator"));
    }

    #[test]
    fn missing_key_falls_back_to_offline() {
        let config = OpenRouterConfig {
            api_key_env: "SC_TEST_NO_SUCH_LLM_KEY_98765".into(),
            ..Default::default()
        };
        let executor = executor_from_config(&config).unwrap();
        assert_eq!(executor.name(), "offline");
    }
}
