//! Shared HTTP plumbing for external service clients.
//!
//! [`ServiceAdapter`] owns the `reqwest` client, base URL, bearer token and
//! retry policy for one collaborator. Calls return an explicit
//! `Result<Value, ServiceFailure>`; [`ServiceAdapter::resolve`] then decides
//! between a deterministic fallback (degraded mode) and a
//! [`StoryCrewError::ServiceConnection`] (strict mode).

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use storycrew_shared::{AdapterSettings, Result, StoryCrewError};

use crate::retry::{FailureKind, RetryPolicy, ServiceFailure, retry};

/// User-Agent string for outbound service requests.
const USER_AGENT: &str = concat!("StoryCrew/", env!("CARGO_PKG_VERSION"));

/// Timeout for a single health check.
const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Connection settings and retry behavior for one external service.
#[derive(Debug, Clone)]
pub struct ServiceAdapter {
    service: &'static str,
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    policy: RetryPolicy,
    degraded_mode: bool,
}

impl ServiceAdapter {
    /// Build an adapter from its config section.
    pub fn new(service: &'static str, settings: &AdapterSettings) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            StoryCrewError::config(format!("{service} base_url is not a valid URL: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(StoryCrewError::config(format!(
                "{service} base_url cannot carry a path: {base_url}"
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout())
            .build()
            .map_err(|e| {
                StoryCrewError::config(format!("failed to build HTTP client for {service}: {e}"))
            })?;

        Ok(Self {
            service,
            client,
            base_url,
            api_key: settings.api_key(),
            policy: RetryPolicy::from(settings),
            degraded_mode: settings.degraded_mode,
        })
    }

    /// Attach a bearer token directly, bypassing env-var lookup.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_mode
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append `segments` to the service root. Each segment is percent-encoded
    /// on its own, so an id holding `/`, `?` or `#` stays inside its segment.
    pub fn endpoint(&self, segments: &[&str]) -> std::result::Result<Url, ServiceFailure> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(ServiceFailure::new(
                FailureKind::Transport,
                format!("{}: invalid path segment {bad:?}", self.service),
            ));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ServiceFailure::new(
                    FailureKind::Transport,
                    format!("{}: base URL cannot carry a path", self.service),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a JSON request with retries.
    pub async fn call<C>(
        &self,
        operation: &'static str,
        method: Method,
        path: &[&str],
        configure: C,
    ) -> std::result::Result<Value, ServiceFailure>
    where
        C: Fn(RequestBuilder) -> RequestBuilder,
    {
        self.call_then(operation, method, path, configure, Ok).await
    }

    /// Like [`call`](Self::call), but `extract` runs inside each attempt so an
    /// unusable body can be classified (and retried or short-circuited).
    pub async fn call_then<C, E>(
        &self,
        operation: &'static str,
        method: Method,
        path: &[&str],
        configure: C,
        extract: E,
    ) -> std::result::Result<Value, ServiceFailure>
    where
        C: Fn(RequestBuilder) -> RequestBuilder,
        E: Fn(Value) -> std::result::Result<Value, ServiceFailure>,
    {
        let url = self.endpoint(path)?;
        let configure = &configure;
        let extract = &extract;
        let method = &method;
        let url = &url;

        retry(self.service, operation, &self.policy, || async move {
            let request = configure(self.client.request(method.clone(), url.clone()));
            let body = self.send_once(request).await?;
            extract(body)
        })
        .await
    }

    /// Turn a call outcome into a value: the response, a fallback in
    /// degraded mode, or a connection error in strict mode.
    pub fn resolve<F>(
        &self,
        operation: &str,
        outcome: std::result::Result<Value, ServiceFailure>,
        fallback: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Value,
    {
        match outcome {
            Ok(value) => Ok(value),
            Err(failure) if self.degraded_mode => {
                warn!(
                    service = self.service,
                    operation,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "service unavailable, serving fallback"
                );
                Ok(fallback())
            }
            Err(failure) => Err(StoryCrewError::ServiceConnection {
                service: self.service.to_string(),
                attempts: failure.attempts,
                message: format!("{operation}: {}", failure.message),
            }),
        }
    }

    /// Degraded adapters report healthy without a remote call; strict ones
    /// call `GET /health` once.
    pub async fn health_check(&self) -> bool {
        if self.degraded_mode {
            return true;
        }
        let url = match self.endpoint(&["health"]) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let request = self
            .client
            .get(url)
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS));
        match self.send_once(request).await {
            Ok(_) => true,
            Err(failure) => {
                debug!(service = self.service, error = %failure.message, "health check failed");
                false
            }
        }
    }

    async fn send_once(
        &self,
        request: RequestBuilder,
    ) -> std::result::Result<Value, ServiceFailure> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceFailure::new(
                FailureKind::Status(status.as_u16()),
                format!("{}: HTTP {status}", self.service),
            ));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            ServiceFailure::new(
                FailureKind::Decode,
                format!("{}: invalid JSON body: {e}", self.service),
            )
        })
    }
}
