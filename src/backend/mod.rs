//! Model backends.
//!
//! Every hosted inference API is wrapped in a [`ModelBackend`]. The executor
//! only ever sees the trait object, so it never branches on which service
//! answers a prompt.

pub mod gateway;
pub mod managed;
pub mod retry;
pub mod sigv4;
pub mod sts;

use crate::error::BackendError;
use crate::models::{BackendRequest, BackendResponse, GenerationParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use gateway::GatewayBackend;
pub use managed::ManagedBackend;
pub use retry::{RetryPolicy, RetryingBackend};

/// Uniform call contract over hosted LLM endpoints.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short name of the backend variant, for logs and reports.
    fn name(&self) -> &'static str;

    /// Model identifier requests are sent to.
    fn model(&self) -> &str;

    /// Total context window of the model, in units.
    fn context_window(&self) -> usize;

    /// Parameters applied when an agent does not override them.
    fn default_params(&self) -> GenerationParams;

    /// Send one prompt and return the response text.
    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;
}

/// Which hosted API to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI-compatible inference gateway with a bearer session token
    #[default]
    Gateway,
    /// Managed foundation-model API signed with cloud credentials
    Managed,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Gateway => write!(f, "gateway"),
            BackendKind::Managed => write!(f, "managed"),
        }
    }
}

/// Settings shared by both backend variants.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model: String,
    /// Base URL; required for the gateway, optional for the managed API.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub context_window: usize,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Session token JSON for the gateway; falls back to `CDP_TOKEN`.
    pub token: Option<String>,
    /// Role the managed backend assumes before calling the model.
    pub assume_role: Option<String>,
    pub sts_endpoint: Option<String>,
}

impl From<&crate::config::BackendConfig> for BackendSettings {
    fn from(config: &crate::config::BackendConfig) -> Self {
        Self {
            kind: config.kind,
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
            context_window: config.context_window,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_seconds),
            token: config.token.clone(),
            assume_role: config.assume_role.clone(),
            sts_endpoint: config.sts_endpoint.clone(),
        }
    }
}

impl BackendSettings {
    pub fn default_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: Some(self.temperature),
            max_output_tokens: Some(self.max_output_tokens),
        }
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, BackendError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to create HTTP client: {}", e)))
    }
}

/// Construct the configured backend, wrapped in the retry policy.
pub async fn build_backend(
    settings: &BackendSettings,
    policy: RetryPolicy,
) -> Result<Arc<dyn ModelBackend>, BackendError> {
    if settings.kind == BackendKind::Gateway && settings.assume_role.is_some() {
        warn!("backend.assume_role only applies to the managed backend, ignoring it");
    }

    let inner: Box<dyn ModelBackend> = match settings.kind {
        BackendKind::Gateway => Box::new(GatewayBackend::from_settings(settings)?),
        BackendKind::Managed => Box::new(ManagedBackend::from_settings(settings).await?),
    };

    info!(
        backend = inner.name(),
        model = inner.model(),
        context_window = inner.context_window(),
        "Backend ready"
    );

    Ok(Arc::new(RetryingBackend::new(inner, policy)))
}

/// Reject empty prompts before any network I/O.
pub(crate) fn check_prompt(request: &BackendRequest) -> Result<(), BackendError> {
    if request.prompt.trim().is_empty() {
        return Err(BackendError::InvalidRequest("prompt is empty".to_string()));
    }
    Ok(())
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_empty_prompt_rejected() {
        let request = BackendRequest::new("   ", GenerationParams::default());
        assert!(matches!(
            check_prompt(&request),
            Err(BackendError::InvalidRequest(_))
        ));
        assert!(check_prompt(&BackendRequest::new("hi", GenerationParams::default())).is_ok());
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_backend_kind_serde() {
        let kind: BackendKind = serde_json::from_str("\"managed\"").unwrap();
        assert_eq!(kind, BackendKind::Managed);
        assert_eq!(BackendKind::Gateway.to_string(), "gateway");
    }
}
