//! Bounded exponential-backoff retries for outbound service calls.
//!
//! A call is attempted at most [`RetryPolicy::max_attempts`] times. Between
//! attempts the caller sleeps for a delay that starts at
//! [`RetryPolicy::initial_delay`] and doubles up to [`RetryPolicy::max_delay`].
//! Failures that cannot succeed on retry short-circuit immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use storycrew_shared::AdapterSettings;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl From<&AdapterSettings> for RetryPolicy {
    fn from(settings: &AdapterSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: settings.backoff_base(),
            max_delay: settings.backoff_cap(),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    /// The sleeps taken between attempts when every attempt fails.
    pub fn schedule(&self) -> Vec<Duration> {
        let waits = self.max_attempts.saturating_sub(1) as usize;
        let mut delays = Vec::with_capacity(waits);
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 0..waits {
            delays.push(delay);
            delay = next_delay(delay, self);
        }
        delays
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Why a single call attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused, DNS, TLS or other transport error.
    Transport,
    /// The per-attempt timeout elapsed.
    Timeout,
    /// The service answered with a non-success status.
    Status(u16),
    /// The body was not the JSON we expected.
    Decode,
    /// The service answered but has nothing for this request.
    Empty,
}

impl FailureKind {
    /// Every transport error and non-success response is retried. Only an
    /// answered lookup with nothing in it is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Empty)
    }
}

/// Outcome of a failed call after retries, returned instead of a fallback
/// value so the caller decides between degrading and failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Attempts made before giving up.
    pub attempts: u32,
}

impl ServiceFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Empty, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.message, self.attempts)
    }
}

impl From<reqwest::Error> for ServiceFailure {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_decode() {
            FailureKind::Decode
        } else if let Some(status) = err.status() {
            FailureKind::Status(status.as_u16())
        } else {
            FailureKind::Transport
        };
        Self::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Run `attempt` until it succeeds, fails non-retryably, or the policy's
/// attempt budget is spent.
pub async fn retry<T, F, Fut>(
    service: &str,
    operation: &str,
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, ServiceFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay.min(policy.max_delay);
    let mut made = 0u32;

    loop {
        made += 1;
        match attempt().await {
            Ok(value) => {
                if made > 1 {
                    tracing::info!(service, operation, attempts = made, "call recovered");
                }
                return Ok(value);
            }
            Err(mut failure) => {
                failure.attempts = made;
                if !failure.is_retryable() {
                    tracing::debug!(
                        service,
                        operation,
                        error = %failure.message,
                        "non-retryable failure"
                    );
                    return Err(failure);
                }
                if made >= max_attempts {
                    tracing::warn!(
                        service,
                        operation,
                        attempts = made,
                        error = %failure.message,
                        "retry budget exhausted"
                    );
                    return Err(failure);
                }
                tracing::warn!(
                    service,
                    operation,
                    attempt = made,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "call failed, retrying"
                );
            }
        }

        tokio::time::sleep(delay).await;
        delay = next_delay(delay, policy);
    }
}
