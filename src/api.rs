//! HTTP client for the challenge API (`/qr-generate`, `/qr-status`, `/debug`).
//!
//! Every request is a JSON `POST` carrying the partner credentials. Responses
//! use a `{success, data, message|error}` envelope. Transport failures and
//! transient HTTP statuses are retried with linear backoff.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ChallengeType, SdkConfig};
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const USER_AGENT: &str = concat!("SunuID-Rust-SDK/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChallengeApiDefaults;

impl ChallengeApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_RETRIES: usize = 3;
    pub const BACKOFF_STEP: Duration = Duration::from_secs(1);
}

#[derive(Clone, Debug)]
pub struct ChallengeApiOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Disables certificate verification; only meant for test relays.
    pub accept_invalid_certs: bool,
}

impl Default for ChallengeApiOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ChallengeApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ChallengeApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::linear(
                ChallengeApiDefaults::MAX_RETRIES,
                ChallengeApiDefaults::BACKOFF_STEP,
            ),
            accept_invalid_certs: false,
        }
    }
}

impl ChallengeApiOptions {
    /// Derives request timeout and retry budget from the SDK config.
    pub fn from_config(config: &SdkConfig) -> Self {
        Self {
            attempt_timeout: config.request_timeout,
            retry_policy: RetryPolicy::linear(config.max_retries, config.retry_backoff),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct ChallengeApiClient {
    http: Client,
    base_url: String,
    client_id: String,
    secret_id: SecretString,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ChallengeApiClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        secret_id: SecretString,
    ) -> Result<Self, ApiError> {
        Self::with_options(base_url, client_id, secret_id, ChallengeApiOptions::default())
    }

    pub fn from_config(config: &SdkConfig) -> Result<Self, ApiError> {
        Self::with_options(
            config.api_url.clone(),
            config.client_id(),
            SecretString::new(config.secret_id().to_string()),
            ChallengeApiOptions::from_config(config),
        )
    }

    pub fn with_options(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        secret_id: SecretString,
        options: ChallengeApiOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            secret_id,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates a QR challenge.
    pub async fn generate_qr(&self, request: &QrGenerateRequest) -> Result<QrGenerated, ApiError> {
        let envelope = self.post("/qr-generate", request).await?;
        parse_generated(&envelope)
    }

    /// Reads the status of a previously created challenge.
    pub async fn check_status(&self, service_id: &str) -> Result<QrStatus, ApiError> {
        let request = QrStatusRequest {
            service_id: service_id.to_string(),
        };
        let envelope = self.post("/qr-status", &request).await?;
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|err| ApiError::Parse(err.to_string()))
    }

    /// Calls the partner self-test endpoint used to resolve partner details.
    pub async fn partner_debug(
        &self,
        challenge_type: ChallengeType,
    ) -> Result<PartnerDebug, ApiError> {
        let mut body = Map::new();
        body.insert("type".to_string(), Value::from(challenge_type.code()));
        let envelope = self.post("/debug", &body).await?;
        Ok(parse_partner_debug(&envelope))
    }

    async fn post<T>(&self, path: &str, request: &T) -> Result<Value, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let endpoint = format!("{}{}", self.base_url, path);
        let body = self.body_with_credentials(request)?;
        let policy = self.retry_policy.clone();

        debug!(event = "api_request", endpoint = %endpoint, keys = body.len());

        let result = retry_async(
            &policy,
            |attempt| {
                let endpoint = endpoint.clone();
                let body = &body;
                async move {
                    let outcome = self.send_attempt(&endpoint, body).await;
                    if let Err(err) = &outcome {
                        warn!(event = "api_attempt_failed", attempt, error = %err);
                    }
                    outcome
                }
            },
            ApiError::is_retryable,
        )
        .await;

        result.map_err(|err| {
            if err.is_retryable() {
                ApiError::RetriesExhausted {
                    attempts: policy.max_attempts.max(1),
                    last: err.to_string(),
                }
            } else {
                err
            }
        })
    }

    fn body_with_credentials<T>(&self, request: &T) -> Result<Map<String, Value>, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let mut body = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(ApiError::Parse(
                    "request body must serialize to a JSON object".to_string(),
                ))
            }
            Err(err) => return Err(ApiError::Parse(err.to_string())),
        };
        body.insert("client_id".to_string(), Value::from(self.client_id.clone()));
        body.insert(
            "secret_id".to_string(),
            Value::from(self.secret_id.expose_secret().clone()),
        );
        Ok(body)
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        body: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        parse_envelope(&text)
    }
}

/// Body of `POST /qr-generate`, minus credentials.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QrGenerateRequest {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub content: String,
    pub label: String,
    /// Caller-supplied options merged into the body, overriding the fields
    /// above on key collision.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize)]
struct QrStatusRequest {
    #[serde(rename = "serviceId")]
    service_id: String,
}

/// Challenge data returned by `/qr-generate`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QrGenerated {
    pub session_id: String,
    pub qr_code: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Value>,
}

/// Challenge status returned by `/qr-status`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QrStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QrStatus {
    /// Status rendered as text, whether the API sent a string or a number.
    pub fn status_text(&self) -> Option<String> {
        self.status.as_ref().and_then(value_to_string)
    }
}

/// Partner details extracted from `/debug`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartnerDebug {
    pub partner_id: Option<i64>,
    pub service_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("api rejected request: {message}")]
    Rejected { message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => !err.is_builder() && !err.is_decode(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Rejected { .. } | Self::Parse(_) | Self::RetriesExhausted { .. } => false,
        }
    }
}

fn parse_envelope(body: &str) -> Result<Value, ApiError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))?;
    let success = value
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if success {
        return Ok(value);
    }

    let message = ["message", "error", "reason"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("unknown failure")
        .to_string();
    Err(ApiError::Rejected { message })
}

fn parse_generated(envelope: &Value) -> Result<QrGenerated, ApiError> {
    let data = envelope
        .get("data")
        .ok_or_else(|| ApiError::Parse("success payload missing data".to_string()))?;

    let session_id = first_string(data, &["sessionId", "session_id", "serviceId"])
        .ok_or_else(|| ApiError::Parse("success payload missing session id".to_string()))?;

    Ok(QrGenerated {
        session_id,
        qr_code: first_string(data, &["qrCodeUrl", "qr_code"]).unwrap_or_default(),
        label: first_string(data, &["label"]).unwrap_or_default(),
        expires_at: data.get("expires_at").filter(|v| !v.is_null()).cloned(),
    })
}

fn parse_partner_debug(envelope: &Value) -> PartnerDebug {
    let partner_id = envelope
        .pointer("/authentication/auth_test/partner_id")
        .and_then(|value| {
            value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        });
    let service_id = envelope
        .get("service_id")
        .and_then(value_to_string)
        .or_else(|| partner_id.map(|id| id.to_string()));

    PartnerDebug {
        partner_id,
        service_id,
    }
}

fn first_string(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| data.get(*key).and_then(value_to_string))
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use secrecy::SecretString;
    use serde_json::{json, Map};

    use super::{
        parse_envelope, parse_generated, parse_partner_debug, summarize_error_body, ApiError,
        ChallengeApiClient, PartnerDebug, QrGenerateRequest, QrStatus,
    };
    use crate::config::ChallengeType;

    #[test]
    fn generated_prefers_camel_case_session_id() {
        let envelope = json!({
            "success": true,
            "data": {
                "sessionId": "camel",
                "session_id": "snake",
                "serviceId": 77,
                "qrCodeUrl": "https://qr.example/1.png",
                "label": "Authentication Fayma",
                "expires_at": "2026-01-01T00:00:00Z"
            }
        });
        let parsed = parse_generated(&envelope).expect("parse");
        assert_eq!(parsed.session_id, "camel");
        assert_eq!(parsed.qr_code, "https://qr.example/1.png");
        assert_eq!(parsed.label, "Authentication Fayma");
        assert_eq!(parsed.expires_at, Some(json!("2026-01-01T00:00:00Z")));
    }

    #[test]
    fn generated_falls_back_to_numeric_service_id() {
        let envelope = json!({"success": true, "data": {"serviceId": 42, "qr_code": "data"}});
        let parsed = parse_generated(&envelope).expect("parse");
        assert_eq!(parsed.session_id, "42");
        assert_eq!(parsed.qr_code, "data");
        assert_eq!(parsed.expires_at, None);
    }

    #[test]
    fn generated_without_session_id_is_a_parse_error() {
        let envelope = json!({"success": true, "data": {"qrCodeUrl": "https://qr.example/1.png"}});
        let error = parse_generated(&envelope).expect_err("missing session id");
        assert!(matches!(&error, ApiError::Parse(message) if message.contains("session id")));
        assert!(!error.is_retryable());

        let blank = json!({"success": true, "data": {"sessionId": "", "qr_code": "data"}});
        assert!(parse_generated(&blank).is_err());
    }

    #[test]
    fn unsuccessful_envelope_is_rejected_with_message() {
        let error = parse_envelope(r#"{"success":false,"message":"bad credentials"}"#)
            .expect_err("rejected");
        match error {
            ApiError::Rejected { message } => assert_eq!(message, "bad credentials"),
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert!(!ApiError::Rejected {
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let server = ApiError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        let client = ApiError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
    }

    #[test]
    fn partner_debug_reads_nested_partner_id() {
        let envelope = json!({
            "success": true,
            "authentication": {"auth_test": {"partner_id": 21}},
        });
        assert_eq!(
            parse_partner_debug(&envelope),
            PartnerDebug {
                partner_id: Some(21),
                service_id: Some("21".to_string()),
            }
        );
    }

    #[test]
    fn status_text_accepts_numbers() {
        let status: QrStatus =
            serde_json::from_value(json!({"status": 2, "user_data": {"name": "Awa"}}))
                .expect("status");
        assert_eq!(status.status_text().as_deref(), Some("2"));
        assert_eq!(status.user_data, Some(json!({"name": "Awa"})));
    }

    #[test]
    fn request_body_carries_credentials_and_extra_options() {
        let client = ChallengeApiClient::new(
            "https://api.example/",
            "client-1",
            SecretString::new("secret-1".to_string()),
        )
        .expect("client");
        assert_eq!(client.base_url(), "https://api.example");

        let mut extra = Map::new();
        extra.insert("theme".to_string(), json!("dark"));
        let request = QrGenerateRequest {
            challenge_type: ChallengeType::Kyc,
            content: "content".to_string(),
            label: "KYC Partner".to_string(),
            extra,
        };

        let body = client.body_with_credentials(&request).expect("body");
        assert_eq!(body.get("type"), Some(&json!(1)));
        assert_eq!(body.get("theme"), Some(&json!("dark")));
        assert_eq!(body.get("client_id"), Some(&json!("client-1")));
        assert_eq!(body.get("secret_id"), Some(&json!("secret-1")));
    }

    #[test]
    fn error_body_summary_prefers_structured_message() {
        assert_eq!(summarize_error_body(r#"{"error":"quota"}"#), "quota");
        assert_eq!(summarize_error_body("plain text"), "plain text");
    }
}
