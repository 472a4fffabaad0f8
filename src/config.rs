//! SDK and realtime channel configuration.
//!
//! Both configurations can be built in code with `with_*` setters or
//! deserialized from a flat set of named options. Unknown keys are ignored
//! and every option has a documented default. Validation is eager and reports
//! every problem found in one [`ConfigError`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

/// Production challenge API base URL.
pub const API_BASE_URL: &str = "https://api.sunuid.fayma.sn";
/// Production realtime relay endpoint (Socket.IO handshake over https).
pub const RELAY_URL: &str = "https://samasocket.fayma.sn:9443";

/// Default values shared by [`SdkConfig`] and [`ChannelConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SdkDefaults;

impl SdkDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_RETRIES: usize = 3;
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(15000);
    pub const REGISTER_EVENT_NAME: &'static str = "register_sid";
}

/// Kind of challenge requested from the identity service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChallengeType {
    Kyc,
    #[default]
    Authentication,
    Signature,
}

impl ChallengeType {
    /// Numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Kyc => 1,
            Self::Authentication => 2,
            Self::Signature => 3,
        }
    }

    /// Human readable name, used as the QR label prefix.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Kyc => "KYC",
            Self::Authentication => "Authentication",
            Self::Signature => "Signature",
        }
    }
}

impl TryFrom<u8> for ChallengeType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Kyc),
            2 => Ok(Self::Authentication),
            3 => Ok(Self::Signature),
            other => Err(format!("invalid challenge type {other} (expected 1, 2 or 3)")),
        }
    }
}

impl From<ChallengeType> for u8 {
    fn from(value: ChallengeType) -> Self {
        value.code()
    }
}

/// Socket.IO protocol revision spoken with the relay.
///
/// `V2` maps to Engine.IO 3 (server joins the default namespace on open and
/// the client drives pings). `V3` and `V4` map to Engine.IO 4 (explicit
/// namespace CONNECT and server-driven pings).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
#[serde(try_from = "VersionRepr")]
pub enum ProtocolVersion {
    #[default]
    V2,
    V3,
    V4,
}

impl ProtocolVersion {
    /// Engine.IO revision sent as the `EIO` query parameter.
    pub fn engine_io_revision(self) -> u8 {
        match self {
            Self::V2 => 3,
            Self::V3 | Self::V4 => 4,
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches(&['v', 'V'][..]) {
            "2" => Ok(Self::V2),
            "3" => Ok(Self::V3),
            "4" => Ok(Self::V4),
            other => Err(format!("unsupported socket.io version {other:?}")),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionRepr {
    Number(u8),
    Text(String),
}

impl TryFrom<VersionRepr> for ProtocolVersion {
    type Error = String;

    fn try_from(value: VersionRepr) -> Result<Self, Self::Error> {
        match value {
            VersionRepr::Number(n) => n.to_string().parse(),
            VersionRepr::Text(text) => text.parse(),
        }
    }
}

/// Transport kinds that may be negotiated with the relay, in priority order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::Polling => f.write_str("polling"),
        }
    }
}

/// Immutable configuration of one realtime channel.
///
/// Durations are read from options as milliseconds, except
/// `connection_timeout` which is in seconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Relay handshake URL (http(s) or ws(s)).
    #[serde(alias = "ws_url")]
    pub url: String,
    #[serde(alias = "socketio_version")]
    pub protocol_version: ProtocolVersion,
    pub transports: Vec<TransportKind>,
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Appended to the handshake URL query string.
    pub query_params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    #[serde(alias = "ssl_verify_peer")]
    pub verify_peer: bool,
    #[serde(alias = "ssl_verify_peer_name")]
    pub verify_peer_name: bool,
    pub allow_self_signed: bool,
    pub auto_register_sid: bool,
    pub register_event_name: String,
    pub register_payload_extra: Map<String, Value>,
    pub reconnect: bool,
    #[serde(with = "duration_millis")]
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// Also schedule reconnects when the very first connect fails.
    pub reconnect_on_initial_failure: bool,
    /// Local heartbeat period; zero disables the heartbeat.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: RELAY_URL.to_string(),
            protocol_version: ProtocolVersion::V2,
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            connection_timeout: SdkDefaults::CONNECTION_TIMEOUT,
            query_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            verify_peer: true,
            verify_peer_name: true,
            allow_self_signed: false,
            auto_register_sid: true,
            register_event_name: SdkDefaults::REGISTER_EVENT_NAME.to_string(),
            register_payload_extra: Map::new(),
            reconnect: true,
            reconnect_interval: SdkDefaults::RECONNECT_INTERVAL,
            max_reconnect_attempts: SdkDefaults::MAX_RECONNECT_ATTEMPTS,
            reconnect_on_initial_failure: false,
            heartbeat_interval: SdkDefaults::HEARTBEAT_INTERVAL,
        }
    }
}

impl ChannelConfig {
    /// Creates a config for the given relay URL with default options.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end().to_string(),
            ..Self::default()
        }
    }

    /// Parses a flat option map, ignoring unknown keys, and validates it.
    pub fn from_options(options: Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(options)
            .map_err(|err| ConfigError::Options(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Configures reconnection; `max_attempts == 0` disables it.
    pub fn with_reconnect(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.reconnect = max_attempts > 0;
        self.reconnect_interval = interval;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Enables or disables the `register_sid` event sent after each connect.
    pub fn with_auto_register(mut self, enabled: bool, extra: Map<String, Value>) -> Self {
        self.auto_register_sid = enabled;
        self.register_payload_extra = extra;
        self
    }

    pub fn with_tls_verification(mut self, verify_peer: bool, verify_peer_name: bool) -> Self {
        self.verify_peer = verify_peer;
        self.verify_peer_name = verify_peer_name;
        self
    }

    /// Returns the relay URL with `query_params` appended to its query string.
    pub fn handshake_url(&self) -> Result<Url, ConfigError> {
        let mut url = parse_url(&self.url, "url", &["http", "https", "ws", "wss"])?;
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect && self.max_reconnect_attempts > 0
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (!self.heartbeat_interval.is_zero()).then_some(self.heartbeat_interval)
    }

    /// Checks the config, collecting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        self.collect_problems(&mut problems);
        ConfigError::from_problems(problems)
    }

    fn collect_problems(&self, problems: &mut Vec<String>) {
        if let Err(err) = parse_url(&self.url, "url", &["http", "https", "ws", "wss"]) {
            problems.push(err.to_string());
        }
        if self.transports.is_empty() {
            problems.push("transports must list at least one transport".to_string());
        }
        if self.connection_timeout.is_zero() {
            problems.push("connection_timeout must be > 0".to_string());
        }
        if self.auto_register_sid && self.register_event_name.trim().is_empty() {
            problems.push("register_event_name must not be empty".to_string());
        }
        if self.reconnect_enabled() && self.reconnect_interval.is_zero() {
            problems.push("reconnect_interval must be > 0 when reconnect is enabled".to_string());
        }
    }
}

/// Top-level SDK configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub api_url: String,
    pub client_id: Option<String>,
    pub secret_id: Option<SecretString>,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub partner_name: Option<String>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub max_retries: usize,
    /// Step of the linear retry backoff; retry `n` waits `n * retry_backoff`.
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    #[serde(alias = "enable_websocket")]
    pub enable_realtime: bool,
    #[serde(alias = "websocket_auto_connect")]
    pub realtime_auto_connect: bool,
    /// Label sent as the `username` handshake parameter.
    pub client_label: Option<String>,
    #[serde(alias = "websocket")]
    pub realtime: ChannelConfig,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            api_url: API_BASE_URL.to_string(),
            client_id: None,
            secret_id: None,
            challenge_type: ChallengeType::default(),
            partner_name: None,
            request_timeout: SdkDefaults::REQUEST_TIMEOUT,
            max_retries: SdkDefaults::MAX_RETRIES,
            retry_backoff: SdkDefaults::RETRY_BACKOFF,
            enable_realtime: false,
            realtime_auto_connect: false,
            client_label: None,
            realtime: ChannelConfig::default(),
        }
    }
}

impl SdkConfig {
    /// Creates a config with partner credentials and default options.
    pub fn new(client_id: impl Into<String>, secret_id: SecretString) -> Self {
        Self {
            client_id: Some(client_id.into()),
            secret_id: Some(secret_id),
            ..Self::default()
        }
    }

    /// Parses a flat option map, ignoring unknown keys, and validates it.
    pub fn from_options(options: Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(options)
            .map_err(|err| ConfigError::Options(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end().to_string();
        self
    }

    pub fn with_challenge_type(mut self, challenge_type: ChallengeType) -> Self {
        self.challenge_type = challenge_type;
        self
    }

    pub fn with_partner_name(mut self, partner_name: impl Into<String>) -> Self {
        self.partner_name = Some(partner_name.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, step: Duration) -> Self {
        self.retry_backoff = step;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables the realtime channel with the given configuration.
    pub fn with_realtime(mut self, realtime: ChannelConfig) -> Self {
        self.enable_realtime = true;
        self.realtime = realtime;
        self
    }

    pub fn with_client_label(mut self, label: impl Into<String>) -> Self {
        self.client_label = Some(label.into());
        self
    }

    /// Returns the client id, or an empty string when unset.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or_default()
    }

    pub(crate) fn secret_id(&self) -> &str {
        self.secret_id
            .as_ref()
            .map(|secret| secret.expose_secret().as_str())
            .unwrap_or_default()
    }

    /// Checks credentials, URLs and the realtime config when enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.client_id().trim().is_empty() {
            problems.push("client_id is missing".to_string());
        }
        if self.secret_id().trim().is_empty() {
            problems.push("secret_id is missing".to_string());
        }
        if let Err(err) = parse_url(&self.api_url, "api_url", &["http", "https"]) {
            problems.push(err.to_string());
        }
        if self.enable_realtime {
            self.realtime.collect_problems(&mut problems);
        }

        ConfigError::from_problems(problems)
    }
}

/// Errors raised while building or validating configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A URL option could not be parsed or has the wrong scheme.
    #[error("{field} is not a valid URL: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    /// Options could not be deserialized.
    #[error("invalid options: {0}")]
    Options(String),

    /// One or more validation problems.
    #[error("invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

impl ConfigError {
    fn from_problems(problems: Vec<String>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self::Invalid(problems))
        }
    }
}

fn parse_url(raw: &str, field: &'static str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidUrl {
        field,
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|err| {
            serde::de::Error::custom(format!("invalid duration {secs}s: {err}"))
        })
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
