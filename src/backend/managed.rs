//! Managed foundation-model API (Bedrock `InvokeModel`).
//!
//! Requests are signed with SigV4 using credentials from the environment or
//! from a named profile in the shared credentials file. With
//! `backend.assume_role` set, those credentials only sign the `AssumeRole`
//! call and model requests use the role's temporary credentials, renewed
//! shortly before they expire.

use super::sigv4::{self, AwsCredentials, RequestToSign};
use super::sts::{AssumedRole, RoleAssumer};
use super::{check_prompt, retry_after, BackendSettings, ModelBackend};
use crate::error::BackendError;
use crate::models::{BackendRequest, BackendResponse, GenerationParams, Usage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const SERVICE: &str = "bedrock";
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

impl AwsCredentials {
    /// Read static credentials from `AWS_ACCESS_KEY_ID` and friends.
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }

    /// Read a profile from a shared credentials file.
    pub fn from_profile_file(path: &Path, profile: &str) -> Result<Option<Self>, BackendError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(parse_profile(&content, profile))
    }

    /// Environment first, then the profile named by `AWS_PROFILE` (or `default`).
    pub fn resolve() -> Result<Self, BackendError> {
        if let Some(credentials) = Self::from_env() {
            debug!("Using cloud credentials from environment");
            return Ok(credentials);
        }

        let profile = std::env::var("AWS_PROFILE").unwrap_or_else(|_| "default".to_string());
        let path = shared_credentials_path().ok_or_else(|| {
            BackendError::Authentication("cannot locate the shared credentials file".to_string())
        })?;

        match Self::from_profile_file(&path, &profile)? {
            Some(credentials) => {
                debug!("Using cloud credentials from profile '{}'", profile);
                Ok(credentials)
            }
            None => Err(BackendError::Authentication(format!(
                "no cloud credentials in the environment or in profile '{}' of {}",
                profile,
                path.display()
            ))),
        }
    }
}

fn shared_credentials_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".aws").join("credentials"))
}

/// Extract one profile from INI-style credentials content.
fn parse_profile(content: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }

        if !in_profile {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(AwsCredentials {
        access_key_id: access_key_id?,
        secret_access_key: secret_access_key?,
        session_token,
    })
}

fn resolve_region(configured: Option<&str>) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var("AWS_REGION").ok())
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .filter(|r| !r.trim().is_empty())
}

#[derive(Debug, Serialize)]
struct InvokeBody<'a> {
    anthropic_version: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<InvokeUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvokeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Where request-signing credentials come from.
enum Signer {
    Static(AwsCredentials),
    Role {
        assumer: RoleAssumer,
        session: Mutex<AssumedRole>,
    },
}

/// Client for the managed model API.
pub struct ManagedBackend {
    settings: BackendSettings,
    http_client: reqwest::Client,
    region: String,
    base_url: String,
    host: String,
    /// Path of the endpoint URL, without a trailing slash.
    path_prefix: String,
    signer: Signer,
}

impl ManagedBackend {
    /// Build a client, resolving region and credentials and assuming the
    /// configured role.
    pub async fn from_settings(settings: &BackendSettings) -> Result<Self, BackendError> {
        let backend = Self::with_credentials(settings, AwsCredentials::resolve()?)?;
        match settings.assume_role.as_deref() {
            Some(role_arn) => backend.assume_role(role_arn).await,
            None => Ok(backend),
        }
    }

    pub fn with_credentials(
        settings: &BackendSettings,
        credentials: AwsCredentials,
    ) -> Result<Self, BackendError> {
        let region = resolve_region(settings.region.as_deref()).ok_or_else(|| {
            BackendError::Configuration(
                "no region configured; set backend.region, AWS_REGION or AWS_DEFAULT_REGION"
                    .to_string(),
            )
        })?;

        if settings.model.trim().is_empty() {
            return Err(BackendError::Configuration(
                "the managed backend needs a model id".to_string(),
            ));
        }

        let base_url = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", region))
            .trim_end_matches('/')
            .to_string();

        let invalid =
            || BackendError::Configuration(format!("invalid managed endpoint: {}", base_url));
        let url = reqwest::Url::parse(&base_url).map_err(|_| invalid())?;
        let host = url
            .host_str()
            .map(|h| match url.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            })
            .ok_or_else(invalid)?;
        let path_prefix = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            settings: settings.clone(),
            http_client: settings.http_client()?,
            region,
            base_url,
            host,
            path_prefix,
            signer: Signer::Static(credentials),
        })
    }

    /// Sign model requests with temporary credentials for `role_arn`, using
    /// the current credentials to call `AssumeRole`.
    pub async fn assume_role(mut self, role_arn: &str) -> Result<Self, BackendError> {
        let base = match &self.signer {
            Signer::Static(credentials) => credentials.clone(),
            Signer::Role { assumer, .. } => {
                return Err(BackendError::Configuration(format!(
                    "role '{}' is already assumed",
                    assumer.role_arn()
                )))
            }
        };

        let assumer = RoleAssumer::new(
            self.http_client.clone(),
            self.settings.sts_endpoint.as_deref(),
            &self.region,
            role_arn,
            base,
        )?;
        let session = assumer.assume().await?;
        info!(
            role = role_arn,
            expires = %session.expiration.map_or_else(|| "unknown".to_string(), |e| e.to_rfc3339()),
            "Assumed role for the managed API"
        );

        self.signer = Signer::Role {
            assumer,
            session: Mutex::new(session),
        };
        Ok(self)
    }

    fn path(&self) -> String {
        format!("/model/{}/invoke", sigv4::uri_encode(&self.settings.model, true))
    }

    /// Credentials for a request sent at `now`, renewing an expiring role session.
    async fn credentials(&self, now: DateTime<Utc>) -> Result<AwsCredentials, BackendError> {
        match &self.signer {
            Signer::Static(credentials) => Ok(credentials.clone()),
            Signer::Role { assumer, session } => {
                let mut session = session.lock().await;
                if !session.is_fresh(now) {
                    debug!(role = assumer.role_arn(), "Role session expiring, renewing");
                    *session = assumer.assume().await?;
                }
                Ok(session.credentials.clone())
            }
        }
    }

    /// SigV4 headers for an invoke request carrying `body`.
    fn sign(
        &self,
        body: &[u8],
        credentials: &AwsCredentials,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        // Non-S3 services sign the full URL path encoded a second time.
        let full_path = format!("{}{}", self.path_prefix, self.path());
        let canonical_uri = sigv4::uri_encode(&full_path, false);
        sigv4::sign(
            &RequestToSign {
                method: "POST",
                canonical_uri: &canonical_uri,
                headers: vec![
                    ("host".to_string(), self.host.clone()),
                    ("content-type".to_string(), "application/json".to_string()),
                ],
                payload: body,
            },
            credentials,
            &self.region,
            SERVICE,
            now,
        )
    }
}

#[async_trait]
impl ModelBackend for ManagedBackend {
    fn name(&self) -> &'static str {
        "managed"
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

        let params = request.params.or(self.default_params());
        let body = serde_json::to_vec(&InvokeBody {
            anthropic_version: ANTHROPIC_VERSION,
            max_tokens: params
                .max_output_tokens
                .unwrap_or(self.settings.max_output_tokens),
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
            temperature: params.temperature,
        })
        .map_err(|e| BackendError::InvalidRequest(format!("failed to encode request: {}", e)))?;

        let now = Utc::now();
        let credentials = self.credentials(now).await?;
        let signed = self.sign(&body, &credentials, now);

        let url = format!("{}{}", self.base_url, self.path());
        debug!(url = %url, prompt_chars = request.prompt.len(), "Sending managed API request");

        let mut builder = self
            .http_client
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "application/json");
        for (name, value) in signed {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &text, wait));
        }

        let text = response
            .text()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;
        parse_response(&text)
    }
}

/// Map failures, catching throttling reported with a 400 status.
fn classify_failure(
    status: u16,
    body: &str,
    wait: Option<std::time::Duration>,
) -> BackendError {
    if status == 400 && body.contains("ThrottlingException") {
        return BackendError::RateLimited {
            message: format!("HTTP 400: {}", body.trim()),
            retry_after: wait,
        };
    }
    BackendError::from_status(status, body, wait)
}

fn parse_response(body: &str) -> Result<BackendResponse, BackendError> {
    let parsed: InvokeResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::MalformedResponse(format!("invalid model response JSON: {}", e)))?;

    let text: String = parsed
        .content
        .into_iter()
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(BackendError::MalformedResponse(
            "response contains no text content".to_string(),
        ));
    }

    Ok(BackendResponse {
        text,
        truncated: parsed.stop_reason.as_deref() == Some("max_tokens"),
        usage: parsed.usage.map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use mockito::{Matcher, Server};
    use std::io::Write;
    use std::time::Duration;

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        }
    }

    fn settings(endpoint: Option<String>) -> BackendSettings {
        BackendSettings {
            kind: BackendKind::Managed,
            model: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
            endpoint,
            region: Some("us-east-1".to_string()),
            context_window: 200_000,
            max_output_tokens: 1024,
            temperature: 0.1,
            timeout: Duration::from_secs(5),
            token: None,
            assume_role: None,
            sts_endpoint: None,
        }
    }

    fn assume_role_xml(expiration: &str) -> String {
        format!(
            "<AssumeRoleResponse><AssumeRoleResult><Credentials>\
             <AccessKeyId>ASIATEMP</AccessKeyId><SecretAccessKey>temp-secret</SecretAccessKey>\
             <SessionToken>temp-token</SessionToken><Expiration>{}</Expiration>\
             </Credentials></AssumeRoleResult></AssumeRoleResponse>",
            expiration
        )
    }

    #[test]
    fn test_parse_profile_sections() {
        let content = "\
[default]
aws_access_key_id = AKIDDEFAULT
aws_secret_access_key = s1

# comment
[work]
aws_access_key_id=AKIDWORK
aws_secret_access_key=s2
aws_session_token=t2
";
        let default = parse_profile(content, "default").unwrap();
        assert_eq!(default.access_key_id, "AKIDDEFAULT");
        assert_eq!(default.session_token, None);

        let work = parse_profile(content, "work").unwrap();
        assert_eq!(work.secret_access_key, "s2");
        assert_eq!(work.session_token.as_deref(), Some("t2"));

        assert!(parse_profile(content, "missing").is_none());
    }

    #[test]
    fn test_profile_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        assert!(AwsCredentials::from_profile_file(&path, "default")
            .unwrap()
            .is_none());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[default]\naws_access_key_id=A\naws_secret_access_key=B").unwrap();
        let creds = AwsCredentials::from_profile_file(&path, "default")
            .unwrap()
            .unwrap();
        assert_eq!(creds.access_key_id, "A");
    }

    #[test]
    fn test_default_endpoint_uses_region() {
        let backend = ManagedBackend::with_credentials(&settings(None), credentials()).unwrap();
        assert_eq!(backend.base_url, "https://bedrock-runtime.us-east-1.amazonaws.com");
        assert_eq!(backend.host, "bedrock-runtime.us-east-1.amazonaws.com");
        assert_eq!(backend.path_prefix, "");
        assert_eq!(
            backend.path(),
            "/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke"
        );
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let response = parse_response(
            r#"{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"stop_reason":"max_tokens","usage":{"input_tokens":7,"output_tokens":2}}"#,
        )
        .unwrap();
        assert_eq!(response.text, "ab");
        assert!(response.truncated);
        assert_eq!(response.usage.unwrap().output_tokens, 2);

        assert!(matches!(
            parse_response(r#"{"content":[]}"#),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_throttling_with_bad_request_status() {
        assert!(matches!(
            classify_failure(400, r#"{"__type":"ThrottlingException"}"#, None),
            BackendError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_failure(400, "ValidationException", None),
            BackendError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_invoke_signs_and_parses() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock(
                "POST",
                "/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke",
            )
            .match_header(
                "authorization",
                Matcher::Regex(
                    r"^AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/\d{8}/us-east-1/bedrock/aws4_request, SignedHeaders=content-type;host;x-amz-date, Signature=[0-9a-f]{64}$"
                        .to_string(),
                ),
            )
            .match_header("x-amz-date", Matcher::Any)
            .match_body(Matcher::PartialJson(serde_json::json!({
                "anthropic_version": "bedrock-2023-05-31",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"hi there"}],"stop_reason":"end_turn"}"#)
            .create_async()
            .await;

        let backend =
            ManagedBackend::with_credentials(&settings(Some(server.url())), credentials()).unwrap();
        let response = backend
            .invoke(&BackendRequest::new("hello", GenerationParams::default()))
            .await
            .unwrap();
        assert_eq!(response.text, "hi there");
        assert!(!response.truncated);
    }

    #[tokio::test]
    async fn test_invoke_maps_auth_failure() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", Matcher::Any)
            .with_status(403)
            .with_body(r#"{"message":"The security token included in the request is expired"}"#)
            .create_async()
            .await;

        let backend =
            ManagedBackend::with_credentials(&settings(Some(server.url())), credentials()).unwrap();
        let err = backend
            .invoke(&BackendRequest::new("hello", GenerationParams::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Authentication(_)));
    }

    #[test]
    fn test_endpoint_path_is_signed() {
        let endpoint = "https://proxy.example.com/bedrock/".to_string();
        let backend =
            ManagedBackend::with_credentials(&settings(Some(endpoint)), credentials()).unwrap();
        assert_eq!(backend.base_url, "https://proxy.example.com/bedrock");
        assert_eq!(backend.path_prefix, "/bedrock");

        let now = Utc::now();
        let signed_for = |canonical_uri: &str| {
            sigv4::sign(
                &RequestToSign {
                    method: "POST",
                    canonical_uri,
                    headers: vec![
                        ("host".to_string(), "proxy.example.com".to_string()),
                        ("content-type".to_string(), "application/json".to_string()),
                    ],
                    payload: b"{}",
                },
                &credentials(),
                "us-east-1",
                SERVICE,
                now,
            )
        };

        let signed = backend.sign(b"{}", &credentials(), now);
        assert_eq!(
            signed,
            signed_for("/bedrock/model/anthropic.claude-3-haiku-20240307-v1%253A0/invoke")
        );
        assert_ne!(
            signed,
            signed_for("/model/anthropic.claude-3-haiku-20240307-v1%253A0/invoke")
        );
    }

    #[tokio::test]
    async fn test_invoke_under_endpoint_path() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                "/proxy/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke",
            )
            .match_header("authorization", Matcher::Any)
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"ok"}]}"#)
            .create_async()
            .await;

        let endpoint = format!("{}/proxy", server.url());
        let backend =
            ManagedBackend::with_credentials(&settings(Some(endpoint)), credentials()).unwrap();
        let response = backend
            .invoke(&BackendRequest::new("hello", GenerationParams::default()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text, "ok");
    }

    #[tokio::test]
    async fn test_assumed_role_signs_model_requests() {
        let mut server = Server::new_async().await;
        let sts = server
            .mock("POST", "/")
            .match_header(
                "authorization",
                Matcher::Regex(r"Credential=AKIDEXAMPLE/\d{8}/us-east-1/sts/".to_string()),
            )
            .with_status(200)
            .with_body(assume_role_xml("2999-01-01T00:00:00Z"))
            .expect(1)
            .create_async()
            .await;
        let model = server
            .mock(
                "POST",
                "/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke",
            )
            .match_header(
                "authorization",
                Matcher::Regex(r"Credential=ASIATEMP/\d{8}/us-east-1/bedrock/".to_string()),
            )
            .match_header("x-amz-security-token", "temp-token")
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"as role"}]}"#)
            .expect(2)
            .create_async()
            .await;

        let mut settings = settings(Some(server.url()));
        settings.sts_endpoint = Some(server.url());
        let backend = ManagedBackend::with_credentials(&settings, credentials())
            .unwrap()
            .assume_role("arn:aws:iam::123456789012:role/reviewer")
            .await
            .unwrap();

        for _ in 0..2 {
            let response = backend
                .invoke(&BackendRequest::new("hello", GenerationParams::default()))
                .await
                .unwrap();
            assert_eq!(response.text, "as role");
        }

        sts.assert_async().await;
        model.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_role_session_is_renewed() {
        let mut server = Server::new_async().await;
        let sts = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(assume_role_xml("2000-01-01T00:00:00Z"))
            .expect(2)
            .create_async()
            .await;
        let _model = server
            .mock(
                "POST",
                "/model/anthropic.claude-3-haiku-20240307-v1%3A0/invoke",
            )
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"ok"}]}"#)
            .create_async()
            .await;

        let mut settings = settings(Some(server.url()));
        settings.sts_endpoint = Some(server.url());
        let backend = ManagedBackend::with_credentials(&settings, credentials())
            .unwrap()
            .assume_role("arn:aws:iam::123456789012:role/reviewer")
            .await
            .unwrap();
        backend
            .invoke(&BackendRequest::new("hello", GenerationParams::default()))
            .await
            .unwrap();

        sts.assert_async().await;
        assert!(matches!(
            backend.assume_role("arn:aws:iam::123456789012:role/other").await,
            Err(BackendError::Configuration(_))
        ));
    }
}
