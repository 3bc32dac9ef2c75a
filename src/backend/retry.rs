use super::ModelBackend;
use crate::error::BackendError;
use crate::models::{BackendRequest, BackendResponse, GenerationParams};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl From<&crate::config::RetryConfig> for RetryPolicy {
    fn from(config: &crate::config::RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), with 0.8x to 1.2x jitter.
    ///
    /// A server's `Retry-After` hint lengthens the delay but never past
    /// `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        base.mul_f64(jitter)
    }
}

/// Retries rate-limit and availability failures of an inner backend.
///
/// Authentication, malformed-response and rejected-request errors surface
/// immediately.
pub struct RetryingBackend {
    inner: Box<dyn ModelBackend>,
    policy: RetryPolicy,
}

impl RetryingBackend {
    pub fn new(inner: Box<dyn ModelBackend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl ModelBackend for RetryingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }

    fn default_params(&self) -> GenerationParams {
        self.inner.default_params()
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let max_retries = self.policy.max_retries;
        let mut attempt = 0;

        loop {
            match self.inner.invoke(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let mut backoff = self.policy.backoff(attempt);
                    if let BackendError::RateLimited {
                        retry_after: Some(wait),
                        ..
                    } = &e
                    {
                        backoff = backoff.max((*wait).min(self.policy.max_backoff));
                    }

                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying backend request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
