//! OpenAI-compatible inference gateway.
//!
//! Authenticated with a bearer session token. The token material is a JSON
//! object `{"token": "...", "expiry": "<RFC 3339>"}`, supplied in the
//! configuration or through the `CDP_TOKEN` environment variable.

use super::{check_prompt, retry_after, BackendSettings, ModelBackend};
use crate::error::BackendError;
use crate::models::{BackendRequest, BackendResponse, GenerationParams, Usage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Environment variable carrying the gateway session token.
pub const TOKEN_ENV: &str = "CDP_TOKEN";

/// A bearer token plus its expiry, if known.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionToken {
    token: String,
    #[serde(default, alias = "expires_at")]
    expiry: Option<DateTime<Utc>>,
}

impl SessionToken {
    /// Parse token JSON.
    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let token: SessionToken = serde_json::from_str(raw.trim()).map_err(|e| {
            BackendError::Authentication(format!(
                "invalid session token format, expected JSON with a 'token' key: {}",
                e
            ))
        })?;

        if token.token.trim().is_empty() {
            return Err(BackendError::Authentication(
                "session token is empty".to_string(),
            ));
        }

        Ok(token)
    }

    /// Resolve the token from an explicit value or the environment.
    pub fn resolve(explicit: Option<&str>) -> Result<Self, BackendError> {
        if let Some(raw) = explicit {
            debug!("Using session token from configuration");
            return Self::parse(raw);
        }

        match std::env::var(TOKEN_ENV) {
            Ok(raw) => {
                debug!("Using session token from {}", TOKEN_ENV);
                Self::parse(&raw)
            }
            Err(_) => Err(BackendError::Authentication(format!(
                "no session token configured and {} is not set",
                TOKEN_ENV
            ))),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Client for the OpenAI-compatible gateway.
pub struct GatewayBackend {
    settings: BackendSettings,
    http_client: reqwest::Client,
    url: String,
    token: SessionToken,
}

impl GatewayBackend {
    /// Build a client, resolving the session token and endpoint.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, BackendError> {
        let token = SessionToken::resolve(settings.token.as_deref())?;
        Self::with_token(settings, token)
    }

    pub fn with_token(settings: &BackendSettings, token: SessionToken) -> Result<Self, BackendError> {
        let endpoint = settings.endpoint.as_deref().ok_or_else(|| {
            BackendError::Configuration("the gateway backend needs an endpoint URL".to_string())
        })?;

        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(BackendError::Configuration(format!(
                "gateway endpoint must start with 'http://' or 'https://': {}",
                endpoint
            )));
        }

        if let Some(expiry) = token.expiry() {
            info!("Gateway session token valid until {}", expiry.to_rfc3339());
        }

        Ok(Self {
            settings: settings.clone(),
            http_client: settings.http_client()?,
            url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            token,
        })
    }
}

#[async_trait]
impl ModelBackend for GatewayBackend {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn context_window(&self) -> usize {
        self.settings.context_window
    }

    fn default_params(&self) -> GenerationParams {
        self.settings.default_params()
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        check_prompt(request)?;

        if self.token.is_expired(Utc::now()) {
            return Err(BackendError::Authentication(format!(
                "session token expired at {}",
                self.token.expiry().map(|e| e.to_rfc3339()).unwrap_or_default()
            )));
        }

        let params = request.params.or(self.default_params());
        let body = ChatRequest {
            model: &self.settings.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: params.max_output_tokens,
            temperature: params.temperature,
        };

        debug!(
            url = %self.url,
            prompt_chars = request.prompt.len(),
            "Sending gateway request"
        );

        let response = self
            .http_client
            .post(&self.url)
            .bearer_auth(&self.token.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), &body, wait));
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;
        parse_response(&body)
    }
}

fn parse_response(body: &str) -> Result<BackendResponse, BackendError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::MalformedResponse(format!("invalid chat completion JSON: {}", e)))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::MalformedResponse("response has no choices".to_string()))?;

    let text = choice
        .message
        .content
        .ok_or_else(|| BackendError::MalformedResponse("choice has no message content".to_string()))?;

    Ok(BackendResponse {
        text,
        truncated: choice.finish_reason.as_deref() == Some("length"),
        usage: parsed.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    })
}
