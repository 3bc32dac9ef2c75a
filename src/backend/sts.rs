//! Temporary credentials from the security token service (`AssumeRole`).
//!
//! The request is a form-encoded query API call signed with SigV4 using the
//! caller's base credentials. The XML answer carries a key pair, a session
//! token and an expiration time.

use super::sigv4::{self, AwsCredentials, RequestToSign};
use crate::error::BackendError;
use chrono::{DateTime, Duration, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use tracing::debug;

/// Session name recorded in the role's audit trail.
pub const SESSION_NAME: &str = "agentflow";

const SERVICE: &str = "sts";
const API_VERSION: &str = "2011-06-15";

// Renew this long before the session actually expires.
const REFRESH_MARGIN_SECONDS: i64 = 300;

/// Credentials issued for an assumed role.
#[derive(Debug, Clone)]
pub struct AssumedRole {
    pub credentials: AwsCredentials,
    pub expiration: Option<DateTime<Utc>>,
}

impl AssumedRole {
    /// Whether the session is still usable at `now`, with a renewal margin.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expiration
            .map_or(true, |expires| now + Duration::seconds(REFRESH_MARGIN_SECONDS) < expires)
    }
}

/// Exchanges base credentials for a role's temporary credentials.
pub struct RoleAssumer {
    http_client: reqwest::Client,
    endpoint: String,
    host: String,
    canonical_uri: String,
    region: String,
    role_arn: String,
    base: AwsCredentials,
}

impl RoleAssumer {
    /// `endpoint` defaults to the regional service endpoint.
    pub fn new(
        http_client: reqwest::Client,
        endpoint: Option<&str>,
        region: &str,
        role_arn: &str,
        base: AwsCredentials,
    ) -> Result<Self, BackendError> {
        if role_arn.trim().is_empty() {
            return Err(BackendError::Configuration(
                "backend.assume_role is empty".to_string(),
            ));
        }

        let endpoint = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://sts.{}.amazonaws.com", region));
        let url = reqwest::Url::parse(&endpoint).map_err(|e| {
            BackendError::Configuration(format!("invalid STS endpoint {}: {}", endpoint, e))
        })?;
        let host = url
            .host_str()
            .map(|h| match url.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            })
            .ok_or_else(|| {
                BackendError::Configuration(format!("invalid STS endpoint: {}", endpoint))
            })?;

        Ok(Self {
            http_client,
            canonical_uri: sigv4::uri_encode(url.path(), false),
            endpoint,
            host,
            region: region.to_string(),
            role_arn: role_arn.to_string(),
            base,
        })
    }

    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    /// Call `AssumeRole` and return the issued credentials.
    pub async fn assume(&self) -> Result<AssumedRole, BackendError> {
        let body = form_body(&[
            ("Action", "AssumeRole"),
            ("Version", API_VERSION),
            ("RoleArn", &self.role_arn),
            ("RoleSessionName", SESSION_NAME),
        ]);
        let content_type = "application/x-www-form-urlencoded; charset=utf-8";

        let signed = sigv4::sign(
            &RequestToSign {
                method: "POST",
                canonical_uri: &self.canonical_uri,
                headers: vec![
                    ("host".to_string(), self.host.clone()),
                    ("content-type".to_string(), content_type.to_string()),
                ],
                payload: body.as_bytes(),
            },
            &self.base,
            &self.region,
            SERVICE,
            Utc::now(),
        );

        debug!(role = %self.role_arn, endpoint = %self.endpoint, "Assuming role");
        let mut builder = self
            .http_client
            .post(&self.endpoint)
            .header("content-type", content_type);
        for (name, value) in signed {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        if !status.is_success() {
            let fields = parse_fields(&text).unwrap_or_default();
            let detail = match (fields.get("Code"), fields.get("Message")) {
                (Some(code), Some(message)) => format!("{}: {}", code, message),
                (Some(code), None) => code.clone(),
                _ => text,
            };
            return Err(BackendError::from_status(
                status.as_u16(),
                &format!("AssumeRole failed: {}", detail),
                None,
            ));
        }

        parse_assume_role(&text)
    }
}

/// Encode `pairs` as an `application/x-www-form-urlencoded` body.
fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", sigv4::uri_encode(k, true), sigv4::uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_assume_role(xml: &str) -> Result<AssumedRole, BackendError> {
    let mut fields = parse_fields(xml)?;
    let mut take = |name: &str| {
        fields.remove(name).ok_or_else(|| {
            BackendError::MalformedResponse(format!("AssumeRole response has no {}", name))
        })
    };

    let credentials = AwsCredentials {
        access_key_id: take("AccessKeyId")?,
        secret_access_key: take("SecretAccessKey")?,
        session_token: Some(take("SessionToken")?),
    };
    let expiration = take("Expiration")
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc));

    Ok(AssumedRole {
        credentials,
        expiration,
    })
}

/// Text of every leaf element, keyed by local name.
fn parse_fields(xml: &str) -> Result<HashMap<String, String>, BackendError> {
    let mut reader = Reader::from_str(xml);
    let mut fields = HashMap::new();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Text(ref e)) => {
                if let Some(name) = &current {
                    let text = e.unescape().map_err(|e| {
                        BackendError::MalformedResponse(format!("invalid STS response XML: {}", e))
                    })?;
                    let text = text.trim();
                    if !text.is_empty() {
                        fields.insert(name.clone(), text.to_string());
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(BackendError::MalformedResponse(format!(
                    "invalid STS response XML: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(fields)
}
