//! High-level challenge service.
//!
//! [`ChallengeService`] is the SDK entry point: it resolves partner details,
//! creates QR challenges through the HTTP API and, when the realtime channel
//! is enabled, binds each challenge to the live relay connection and
//! subscribes to its session.
//!
//! Runtime failures are returned as [`Envelope`] values
//! (`{success, data|error}`); configuration errors fail fast at construction.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ChallengeApiClient, QrGenerateRequest, QrStatus};
use crate::config::{ChallengeType, ChannelConfig, ConfigError, SdkConfig};
use crate::realtime::proto::unix_now;
use crate::realtime::{EventKind, RealtimeClient, RealtimeError, SessionRecord, Transport};

/// Partner id with a registered display name.
const FAYMA_PARTNER_ID: i64 = 21;
const UNKNOWN_PARTNER: &str = "Partner_unknown";

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sdk is not initialised; call init() first")]
    NotInitialized,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("realtime channel is disabled in the configuration")]
    RealtimeDisabled,

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

/// Result shape returned to host applications: `{success, data}` or
/// `{success: false, error}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

impl<T, E: fmt::Display> From<Result<T, E>> for Envelope<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Partner details resolved during [`ChallengeService::init`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartnerInfo {
    pub partner_id: Option<i64>,
    pub partner_name: String,
    pub service_id: Option<String>,
}

/// A created QR challenge.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QrChallenge {
    pub session_id: String,
    pub qr_code: String,
    /// Content encoded in the QR code: the relay connection id when the
    /// realtime channel is connected, otherwise the caller's content or a
    /// generated session code.
    pub content: String,
    pub label: String,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub partner_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Value>,
    /// Whether the session was subscribed on the realtime channel.
    pub subscribed: bool,
}

pub struct ChallengeService {
    config: SdkConfig,
    api: ChallengeApiClient,
    partner: Option<PartnerInfo>,
    realtime: Option<RealtimeClient>,
    realtime_transport: Option<Box<dyn Transport>>,
}

impl ChallengeService {
    /// Validates `config` and prepares the API client.
    pub fn new(config: SdkConfig) -> Result<Self, ChallengeError> {
        config.validate()?;
        let api = ChallengeApiClient::from_config(&config)?;
        Ok(Self {
            config,
            api,
            partner: None,
            realtime: None,
            realtime_transport: None,
        })
    }

    /// Uses `transport` instead of Socket.IO for the realtime channel.
    pub fn with_realtime_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.realtime_transport = Some(transport);
        self
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.partner.is_some()
    }

    pub fn partner_info(&self) -> Option<&PartnerInfo> {
        self.partner.as_ref()
    }

    /// Resolves partner details and, when enabled, prepares (and optionally
    /// connects) the realtime channel.
    ///
    /// Partner lookup failures fall back to placeholder details.
    pub async fn init(&mut self) -> Result<&PartnerInfo, ChallengeError> {
        let partner = self.fetch_partner_info().await;
        info!(
            event = "sdk_initialized",
            partner = %partner.partner_name,
            partner_id = ?partner.partner_id
        );
        self.partner = Some(partner);

        if self.config.enable_realtime {
            self.init_realtime()?;
            if self.config.realtime_auto_connect && !self.connect_realtime().await {
                warn!(event = "realtime_auto_connect_failed");
            }
        }

        self.partner.as_ref().ok_or(ChallengeError::NotInitialized)
    }

    async fn fetch_partner_info(&self) -> PartnerInfo {
        let fallback_name = || {
            self.config
                .partner_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_PARTNER.to_string())
        };

        match self.api.partner_debug(self.config.challenge_type).await {
            Ok(debug) => match debug.partner_id {
                Some(partner_id) => PartnerInfo {
                    partner_id: Some(partner_id),
                    partner_name: partner_name_for(partner_id),
                    service_id: debug.service_id,
                },
                None => PartnerInfo {
                    partner_id: None,
                    partner_name: fallback_name(),
                    service_id: None,
                },
            },
            Err(err) => {
                warn!(event = "partner_lookup_failed", error = %err);
                PartnerInfo {
                    partner_id: None,
                    partner_name: fallback_name(),
                    service_id: None,
                }
            }
        }
    }

    /// Builds the realtime client if it does not exist yet.
    pub fn init_realtime(&mut self) -> Result<&RealtimeClient, ChallengeError> {
        if !self.config.enable_realtime {
            warn!(event = "realtime_disabled");
            return Err(ChallengeError::RealtimeDisabled);
        }
        if self.realtime.is_none() {
            let channel = self.realtime_channel_config();
            let client = match self.realtime_transport.take() {
                Some(transport) => RealtimeClient::with_transport(channel, transport)?,
                None => RealtimeClient::new(channel)?,
            };
            debug!(event = "realtime_client_ready", url = %client.config().url);
            self.realtime = Some(client);
        }
        self.realtime.as_ref().ok_or(ChallengeError::RealtimeDisabled)
    }

    /// Channel config with the partner handshake parameters filled in.
    ///
    /// Caller-supplied query parameters and register fields take precedence.
    pub fn realtime_channel_config(&self) -> ChannelConfig {
        let mut channel = self.config.realtime.clone();
        let client_id = self.config.client_id().to_string();
        let username = self
            .config
            .client_label
            .clone()
            .unwrap_or_else(|| "rust-sdk".to_string());
        for (key, value) in [
            ("token", client_id.clone()),
            ("type", "web".to_string()),
            ("userId", client_id),
            ("username", username),
        ] {
            channel
                .query_params
                .entry(key.to_string())
                .or_insert(value);
        }

        if !channel.register_payload_extra.contains_key("partner") {
            let partner = self
                .config
                .partner_name
                .clone()
                .or_else(|| self.partner.as_ref().map(|p| p.partner_name.clone()))
                .unwrap_or_else(|| "unknown".to_string());
            channel
                .register_payload_extra
                .insert("partner".to_string(), Value::from(partner));
        }
        channel
    }

    /// Connects the realtime channel, creating it first when needed.
    pub async fn connect_realtime(&mut self) -> bool {
        let client = match self.init_realtime() {
            Ok(client) => client.clone(),
            Err(err) => {
                warn!(event = "realtime_connect_skipped", error = %err);
                return false;
            }
        };
        client.connect().await
    }

    /// Creates a QR challenge, reporting failures in the envelope.
    pub async fn generate_qr(
        &self,
        content: Option<&str>,
        options: Map<String, Value>,
    ) -> Envelope<QrChallenge> {
        match self.try_generate_qr(content, options).await {
            Ok(challenge) => Envelope::ok(challenge),
            Err(err) => {
                warn!(event = "qr_generate_failed", error = %err);
                Envelope::error(format!("QR generation failed: {err}"))
            }
        }
    }

    /// Creates a QR challenge.
    ///
    /// While the realtime channel is connected, the QR content is the relay
    /// connection id and the new session is subscribed right away. `options`
    /// are merged into the request body.
    pub async fn try_generate_qr(
        &self,
        content: Option<&str>,
        options: Map<String, Value>,
    ) -> Result<QrChallenge, ChallengeError> {
        let partner = self.partner.as_ref().ok_or(ChallengeError::NotInitialized)?;

        let connected = self.realtime.as_ref().filter(|client| client.is_connected());
        let content = match connected.and_then(RealtimeClient::connection_id) {
            Some(connection_id) => connection_id,
            None => content
                .map(str::to_string)
                .unwrap_or_else(generate_session_code),
        };

        let challenge_type = self.config.challenge_type;
        let request = QrGenerateRequest {
            challenge_type,
            content: content.clone(),
            label: format!("{} {}", challenge_type.display_name(), partner.partner_name),
            extra: options,
        };
        let generated = self.api.generate_qr(&request).await?;

        let subscribed = self
            .realtime
            .as_ref()
            .is_some_and(|client| client.subscribe(&generated.session_id));
        info!(
            event = "qr_generated",
            session_id = %generated.session_id,
            subscribed
        );

        Ok(QrChallenge {
            session_id: generated.session_id,
            qr_code: generated.qr_code,
            content,
            label: generated.label,
            challenge_type,
            partner_name: partner.partner_name.clone(),
            expires_at: generated.expires_at,
            subscribed,
        })
    }

    /// Reads a challenge status, reporting failures in the envelope.
    pub async fn check_qr_status(&self, session_id: &str) -> Envelope<QrStatus> {
        match self.try_check_qr_status(session_id).await {
            Ok(status) => Envelope::ok(status),
            Err(err) => {
                warn!(event = "qr_status_failed", session_id, error = %err);
                Envelope::error(format!("QR status check failed: {err}"))
            }
        }
    }

    pub async fn try_check_qr_status(&self, session_id: &str) -> Result<QrStatus, ChallengeError> {
        if !self.is_initialized() {
            return Err(ChallengeError::NotInitialized);
        }
        Ok(self.api.check_status(session_id).await?)
    }

    pub fn realtime(&self) -> Option<&RealtimeClient> {
        self.realtime.as_ref()
    }

    pub fn subscribe_to_session(&self, session_id: &str) -> bool {
        self.realtime
            .as_ref()
            .is_some_and(|client| client.subscribe(session_id))
    }

    pub fn unsubscribe_from_session(&self, session_id: &str) -> bool {
        self.realtime
            .as_ref()
            .is_some_and(|client| client.unsubscribe(session_id))
    }

    /// Registers a realtime callback; returns `false` when the channel has
    /// not been initialised.
    pub fn on_realtime_event<F>(&self, kind: EventKind, callback: F) -> bool
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        match self.realtime.as_ref() {
            Some(client) => {
                client.on(kind, callback);
                true
            }
            None => false,
        }
    }

    pub fn send_realtime_message(&self, message: &Value) -> bool {
        self.realtime
            .as_ref()
            .is_some_and(|client| client.send_message(message))
    }

    pub fn disconnect_realtime(&self) {
        if let Some(client) = self.realtime.as_ref() {
            client.disconnect();
        }
    }

    pub fn is_realtime_connected(&self) -> bool {
        self.realtime.as_ref().is_some_and(RealtimeClient::is_connected)
    }

    pub fn realtime_connection_id(&self) -> Option<String> {
        self.realtime.as_ref().and_then(RealtimeClient::connection_id)
    }

    pub fn realtime_last_error(&self) -> Option<String> {
        self.realtime.as_ref().and_then(RealtimeClient::last_error)
    }

    pub fn realtime_sessions(&self) -> Vec<(String, SessionRecord)> {
        self.realtime
            .as_ref()
            .map(|client| client.active_sessions().into_iter().collect())
            .unwrap_or_default()
    }
}

/// Display name registered for a partner id.
pub fn partner_name_for(partner_id: i64) -> String {
    match partner_id {
        FAYMA_PARTNER_ID => "Fayma".to_string(),
        other => format!("Partner_{other}"),
    }
}

/// Unique session code: base64 of `"<unix seconds>_<16 hex chars>"`.
pub fn generate_session_code() -> String {
    let random: [u8; 8] = rand::random();
    let hex: String = random.iter().map(|byte| format!("{byte:02x}")).collect();
    BASE64_STANDARD.encode(format!("{}_{hex}", unix_now()))
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine as _;
    use secrecy::SecretString;
    use serde_json::{json, Map, Value};

    use super::{
        generate_session_code, partner_name_for, ChallengeError, ChallengeService, Envelope,
    };
    use crate::config::{ChannelConfig, SdkConfig};

    fn config() -> SdkConfig {
        SdkConfig::new("client-1", SecretString::new("secret-1".to_string()))
            .with_api_url("http://127.0.0.1:9")
    }

    #[test]
    fn session_code_is_base64_timestamp_and_hex() {
        let code = generate_session_code();
        let decoded = String::from_utf8(BASE64_STANDARD.decode(code).expect("base64")).expect("utf8");
        let (timestamp, random) = decoded.split_once('_').expect("separator");
        assert!(timestamp.parse::<u64>().is_ok());
        assert_eq!(random.len(), 16);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_session_code(), generate_session_code());
    }

    #[test]
    fn partner_names_fall_back_to_id() {
        assert_eq!(partner_name_for(21), "Fayma");
        assert_eq!(partner_name_for(7), "Partner_7");
    }

    #[test]
    fn envelope_serializes_success_or_error_only() {
        let ok = serde_json::to_value(Envelope::ok(json!({"session_id": "S1"}))).expect("json");
        assert_eq!(ok, json!({"success": true, "data": {"session_id": "S1"}}));

        let failed: Envelope<Value> = Envelope::error("boom");
        assert_eq!(
            serde_json::to_value(&failed).expect("json"),
            json!({"success": false, "error": "boom"})
        );
        assert_eq!(failed.into_result(), Err("boom".to_string()));

        let from_result: Envelope<u8> = Err::<u8, _>("bad").into();
        assert!(!from_result.success);
    }

    #[test]
    fn invalid_config_fails_fast() {
        let err = ChallengeService::new(SdkConfig::default()).err().expect("missing credentials");
        assert!(matches!(err, ChallengeError::Config(_)));
    }

    #[test]
    fn realtime_handshake_parameters_are_filled_in() {
        let mut sdk = config().with_partner_name("Fayma").with_client_label("kiosk-3");
        sdk.realtime = ChannelConfig::default().with_query_param("type", "mobile");
        let service = ChallengeService::new(sdk).expect("service");

        let channel = service.realtime_channel_config();
        assert_eq!(channel.query_params["token"], "client-1");
        assert_eq!(channel.query_params["userId"], "client-1");
        assert_eq!(channel.query_params["username"], "kiosk-3");
        assert_eq!(channel.query_params["type"], "mobile");
        assert_eq!(channel.register_payload_extra["partner"], json!("Fayma"));
    }

    #[tokio::test]
    async fn challenges_require_init() {
        let service = ChallengeService::new(config()).expect("service");
        assert!(!service.is_initialized());
        assert!(matches!(
            service.try_generate_qr(None, Map::new()).await,
            Err(ChallengeError::NotInitialized)
        ));

        let envelope = service.check_qr_status("S1").await;
        assert!(!envelope.success);
        assert!(envelope
            .error
            .as_deref()
            .is_some_and(|err| err.contains("not initialised")));
    }

    #[test]
    fn realtime_requires_opt_in() {
        let mut service = ChallengeService::new(config()).expect("service");
        assert!(matches!(
            service.init_realtime(),
            Err(ChallengeError::RealtimeDisabled)
        ));
        assert!(!service.subscribe_to_session("S1"));
        assert!(!service.is_realtime_connected());
        assert!(service.realtime_sessions().is_empty());
    }
}
