//! Relay transports.
//!
//! [`Transport`] is the seam between the realtime client and the wire. The
//! default [`SocketIoTransport`] speaks Engine.IO/Socket.IO over a websocket
//! and falls back to long-polling; [`BridgeTransport`] relays events through
//! an HTTP bridge service.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ChannelConfig, ConfigError, ProtocolVersion, TransportKind};
use crate::realtime::proto::{
    decode_payload, encode_payload, EnginePacket, InboundFrame, OutboundEvent, ProtocolError,
    SocketPacket,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors raised while opening or using a relay connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("invalid relay configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("not connected")]
    NotConnected,
}

/// A persistent connection to the notification relay.
///
/// Implementations own exactly one connection at a time. `receive` is polled
/// from a `select!` loop and must be cancel-safe between frames.
#[async_trait]
pub trait Transport: Send {
    /// Opens the connection and returns the relay-issued connection id.
    async fn connect(&mut self, config: &ChannelConfig) -> Result<String, TransportError>;

    /// Emits a named event over the open connection.
    async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError>;

    /// Waits for the next application frame.
    ///
    /// Protocol-level traffic (pings, namespace acks) is handled internally.
    /// Returns [`TransportError::NotConnected`] when no connection is open and
    /// [`TransportError::Closed`] when the relay ends the connection.
    async fn receive(&mut self) -> Result<InboundFrame, TransportError>;

    /// Releases the connection. Safe to call when already closed.
    async fn close(&mut self);

    fn connection_id(&self) -> Option<&str>;

    fn is_connected(&self) -> bool {
        self.connection_id().is_some()
    }
}

/// Socket.IO client transport trying websocket then long-polling.
#[derive(Default)]
pub struct SocketIoTransport {
    link: Option<Link>,
    kind: Option<TransportKind>,
    connection_id: Option<String>,
    client_ping: Option<ClientPing>,
}

struct ClientPing {
    interval: Duration,
    next: Instant,
}

impl SocketIoTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport kind of the open connection.
    pub fn active_kind(&self) -> Option<TransportKind> {
        self.kind
    }

    async fn handshake(
        &mut self,
        config: &ChannelConfig,
        kind: TransportKind,
    ) -> Result<String, TransportError> {
        let revision = config.protocol_version.engine_io_revision();
        let url = engine_url(config, kind)?;
        let mut link = match kind {
            TransportKind::WebSocket => Link::WebSocket(Box::new(open_websocket(config, &url).await?)),
            TransportKind::Polling => {
                Link::Polling(PollingLink::open(http_client(config)?, url, revision).await?)
            }
        };

        let open = loop {
            match EnginePacket::decode(&link.next_text().await?)? {
                EnginePacket::Open(info) => break info,
                EnginePacket::Noop => continue,
                other => {
                    return Err(TransportError::Rejected(format!(
                        "expected open packet, got {other:?}"
                    )))
                }
            }
        };

        if config.protocol_version != ProtocolVersion::V2 {
            let connect = SocketPacket::Connect {
                namespace: "/".to_string(),
                payload: None,
            };
            link.send_text(connect.to_engine_text()).await?;
        }
        let namespace_sid = wait_for_namespace(&mut link).await?;

        let connection_id = match config.protocol_version {
            ProtocolVersion::V2 => open.sid.clone(),
            ProtocolVersion::V3 | ProtocolVersion::V4 => namespace_sid.unwrap_or(open.sid.clone()),
        };
        self.client_ping = (config.protocol_version == ProtocolVersion::V2
            && open.ping_interval_ms > 0)
            .then(|| {
                let interval = Duration::from_millis(open.ping_interval_ms);
                ClientPing {
                    interval,
                    next: Instant::now() + interval,
                }
            });
        self.link = Some(link);
        self.kind = Some(kind);
        self.connection_id = Some(connection_id.clone());
        Ok(connection_id)
    }

    async fn next_packet(&mut self) -> Result<String, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let Some(ping) = self.client_ping.as_mut() else {
            return link.next_text().await;
        };
        loop {
            tokio::select! {
                text = link.next_text() => return text,
                _ = tokio::time::sleep_until(ping.next) => {
                    ping.next = Instant::now() + ping.interval;
                    link.send_text(EnginePacket::Ping(String::new()).encode()).await?;
                }
            }
        }
    }

    async fn send_engine(&mut self, packet: EnginePacket) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        link.send_text(packet.encode()).await
    }
}

#[async_trait]
impl Transport for SocketIoTransport {
    async fn connect(&mut self, config: &ChannelConfig) -> Result<String, TransportError> {
        self.close().await;

        let mut last_error = None;
        for kind in &config.transports {
            debug!(event = "relay_handshake_attempt", transport = %kind, url = %config.url);
            match tokio::time::timeout(config.connection_timeout, self.handshake(config, *kind))
                .await
            {
                Ok(Ok(connection_id)) => {
                    info!(
                        event = "relay_handshake_ok",
                        transport = %kind,
                        connection_id = %connection_id
                    );
                    return Ok(connection_id);
                }
                Ok(Err(err)) => {
                    warn!(event = "relay_handshake_failed", transport = %kind, error = %err);
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(event = "relay_handshake_timeout", transport = %kind);
                    last_error = Some(TransportError::Timeout(config.connection_timeout));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Rejected("no transport configured".to_string())))
    }

    async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let packet = SocketPacket::event(event.event.clone(), event.data.clone());
        link.send_text(packet.to_engine_text()).await
    }

    async fn receive(&mut self) -> Result<InboundFrame, TransportError> {
        loop {
            let text = self.next_packet().await?;
            let packet = match EnginePacket::decode(&text) {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(event = "relay_packet_invalid", layer = "engine.io", error = %err);
                    continue;
                }
            };

            match packet {
                EnginePacket::Ping(data) => self.send_engine(EnginePacket::Pong(data)).await?,
                EnginePacket::Close => {
                    return Err(TransportError::Closed("relay sent close".to_string()))
                }
                EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                    Ok(SocketPacket::Event { name, args, .. }) => {
                        return Ok(InboundFrame::from_event(name, args))
                    }
                    Ok(SocketPacket::Disconnect { namespace }) => {
                        return Err(TransportError::Closed(format!(
                            "relay disconnected namespace {namespace}"
                        )))
                    }
                    Ok(other) => debug!(event = "relay_packet_ignored", packet = ?other),
                    Err(err) => {
                        warn!(event = "relay_packet_invalid", layer = "socket.io", error = %err)
                    }
                },
                EnginePacket::Open(_)
                | EnginePacket::Pong(_)
                | EnginePacket::Upgrade
                | EnginePacket::Noop => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
            debug!(event = "relay_connection_closed");
        }
        self.kind = None;
        self.connection_id = None;
        self.client_ping = None;
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }
}

async fn wait_for_namespace(link: &mut Link) -> Result<Option<String>, TransportError> {
    loop {
        match EnginePacket::decode(&link.next_text().await?)? {
            EnginePacket::Message(body) => match SocketPacket::decode(&body)? {
                SocketPacket::Connect { payload, .. } => {
                    return Ok(payload
                        .as_ref()
                        .and_then(|payload| payload.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string))
                }
                SocketPacket::ConnectError { payload, .. } => {
                    return Err(TransportError::Rejected(payload.to_string()))
                }
                _ => {}
            },
            EnginePacket::Ping(data) => link.send_text(EnginePacket::Pong(data).encode()).await?,
            EnginePacket::Close => {
                return Err(TransportError::Closed(
                    "relay closed before namespace connect".to_string(),
                ))
            }
            _ => {}
        }
    }
}

/// Builds the Engine.IO endpoint URL for one transport kind.
///
/// The relay URL keeps its query string; `/socket.io/` is used when the URL
/// has no path of its own.
pub(crate) fn engine_url(config: &ChannelConfig, kind: TransportKind) -> Result<Url, TransportError> {
    let mut url = config.handshake_url()?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/socket.io/");
    }
    let secure = matches!(url.scheme(), "https" | "wss");
    let scheme = match (kind, secure) {
        (TransportKind::WebSocket, true) => "wss",
        (TransportKind::WebSocket, false) => "ws",
        (TransportKind::Polling, true) => "https",
        (TransportKind::Polling, false) => "http",
    };
    url.set_scheme(scheme).map_err(|_| {
        TransportError::Config(ConfigError::InvalidUrl {
            field: "url",
            reason: format!("cannot use scheme {scheme}"),
        })
    })?;
    url.query_pairs_mut()
        .append_pair(
            "EIO",
            &config.protocol_version.engine_io_revision().to_string(),
        )
        .append_pair("transport", &kind.to_string());
    Ok(url)
}

fn tls_connector(config: &ChannelConfig) -> Result<native_tls::TlsConnector, TransportError> {
    Ok(native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!config.verify_peer || config.allow_self_signed)
        .danger_accept_invalid_hostnames(!config.verify_peer_name)
        .build()?)
}

fn http_client(config: &ChannelConfig) -> Result<reqwest::Client, TransportError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &config.headers {
        let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader { name: name.clone() })?;
        let header_value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader { name: name.clone() })?;
        headers.insert(header_name, header_value);
    }

    Ok(reqwest::Client::builder()
        .connect_timeout(config.connection_timeout)
        .default_headers(headers)
        .danger_accept_invalid_certs(!config.verify_peer || config.allow_self_signed)
        .danger_accept_invalid_hostnames(!config.verify_peer_name)
        .build()?)
}

async fn open_websocket(config: &ChannelConfig, url: &Url) -> Result<WsStream, TransportError> {
    use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

    let mut request = url.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader { name: name.clone() })?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader { name: name.clone() })?;
        request.headers_mut().insert(header_name, header_value);
    }

    let connector = Connector::NativeTls(tls_connector(config)?);
    let (socket, _) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
            .await?;
    Ok(socket)
}

enum Link {
    WebSocket(Box<WsStream>),
    Polling(PollingLink),
}

impl Link {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        match self {
            Self::WebSocket(socket) => socket.send(Message::Text(text)).await.map_err(Into::into),
            Self::Polling(polling) => polling.send_text(text).await,
        }
    }

    async fn next_text(&mut self) -> Result<String, TransportError> {
        match self {
            Self::WebSocket(socket) => loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(text),
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(TransportError::Closed("websocket closed".to_string()))
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(event = "relay_binary_frame_skipped");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(TransportError::WebSocket(err)),
                    None => return Err(TransportError::Closed("websocket ended".to_string())),
                }
            },
            Self::Polling(polling) => polling.next_text().await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::WebSocket(socket) => {
                let _ = WebSocketStream::close(socket.as_mut(), None).await;
            }
            Self::Polling(polling) => polling.close().await,
        }
    }
}

/// Engine.IO long-polling session.
///
/// A background task keeps one GET outstanding and forwards decoded packets,
/// so reads stay cancel-safe.
struct PollingLink {
    http: reqwest::Client,
    endpoint: Url,
    revision: u8,
    buffered: VecDeque<String>,
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    poller: JoinHandle<()>,
}

impl PollingLink {
    async fn open(http: reqwest::Client, url: Url, revision: u8) -> Result<Self, TransportError> {
        let body = http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let packets = decode_payload(revision, &body)?;
        let first = packets.first().ok_or(ProtocolError::Empty)?;
        let sid = match EnginePacket::decode(first)? {
            EnginePacket::Open(info) => info.sid,
            other => {
                return Err(TransportError::Rejected(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        };

        let mut endpoint = url;
        endpoint.query_pairs_mut().append_pair("sid", &sid);

        let (tx, inbound) = mpsc::unbounded_channel();
        let poller = tokio::spawn(poll_loop(http.clone(), endpoint.clone(), revision, tx));

        Ok(Self {
            http,
            endpoint,
            revision,
            buffered: packets.into(),
            inbound,
            poller,
        })
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(encode_payload(self.revision, &[text]))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn next_text(&mut self) -> Result<String, TransportError> {
        if let Some(packet) = self.buffered.pop_front() {
            return Ok(packet);
        }
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed("polling stopped".to_string())),
        }
    }

    async fn close(&mut self) {
        self.poller.abort();
        let _ = self.send_text(EnginePacket::Close.encode()).await;
    }
}

impl Drop for PollingLink {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn poll_loop(
    http: reqwest::Client,
    endpoint: Url,
    revision: u8,
    tx: mpsc::UnboundedSender<Result<String, TransportError>>,
) {
    while !tx.is_closed() {
        let body = match poll_once(&http, &endpoint).await {
            Ok(body) => body,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        match decode_payload(revision, &body) {
            Ok(packets) => {
                for packet in packets {
                    if tx.send(Ok(packet)).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        }
    }
}

async fn poll_once(http: &reqwest::Client, endpoint: &Url) -> Result<String, TransportError> {
    Ok(http
        .get(endpoint.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

/// Transport relaying events through an HTTP bridge service.
///
/// The bridge holds the real Socket.IO connection. `connect` posts the
/// handshake parameters to `{bridge_url}/connect` and `send` posts events to
/// `{bridge_url}/emit`. The bridge does not push events back, so `receive`
/// idles until the connection is closed.
pub struct BridgeTransport {
    bridge_url: Url,
    http: Option<reqwest::Client>,
    connection_id: Option<String>,
}

impl BridgeTransport {
    pub fn new(bridge_url: &str) -> Result<Self, TransportError> {
        let mut bridge_url = Url::parse(bridge_url.trim()).map_err(|err| {
            TransportError::Config(ConfigError::InvalidUrl {
                field: "bridge_url",
                reason: err.to_string(),
            })
        })?;
        if !bridge_url.path().ends_with('/') {
            let path = format!("{}/", bridge_url.path());
            bridge_url.set_path(&path);
        }
        Ok(Self {
            bridge_url,
            http: None,
            connection_id: None,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.bridge_url.join(path).map_err(|err| {
            TransportError::Config(ConfigError::InvalidUrl {
                field: "bridge_url",
                reason: err.to_string(),
            })
        })
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&mut self, config: &ChannelConfig) -> Result<String, TransportError> {
        self.close().await;

        let http = reqwest::Client::builder()
            .timeout(config.connection_timeout)
            .danger_accept_invalid_certs(!config.verify_peer || config.allow_self_signed)
            .danger_accept_invalid_hostnames(!config.verify_peer_name)
            .build()?;
        let query = &config.query_params;
        let param = |key: &str, default: &str| {
            query.get(key).cloned().unwrap_or_else(|| default.to_string())
        };
        let payload = json!({
            "token": param("token", ""),
            "type": param("type", "web"),
            "userId": param("userId", ""),
            "username": param("username", "rust-sdk"),
            "query": query,
        });

        let response: Value = http
            .post(self.endpoint("connect")?)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.get("success").and_then(Value::as_bool).unwrap_or(false) {
            return Err(TransportError::Rejected(response.to_string()));
        }
        let sid = response
            .get("sid")
            .and_then(Value::as_str)
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| TransportError::Rejected("bridge returned no sid".to_string()))?
            .to_string();

        info!(event = "bridge_connected", connection_id = %sid);
        self.http = Some(http);
        self.connection_id = Some(sid.clone());
        Ok(sid)
    }

    async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError> {
        let (Some(http), Some(sid)) = (self.http.as_ref(), self.connection_id.as_deref()) else {
            return Err(TransportError::NotConnected);
        };
        let response = http
            .post(self.endpoint("emit")?)
            .json(&json!({ "sid": sid, "event": event.event, "data": event.data }))
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(TransportError::Rejected(format!(
                "bridge emit returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<InboundFrame, TransportError> {
        if self.connection_id.is_none() {
            return Err(TransportError::NotConnected);
        }
        std::future::pending().await
    }

    async fn close(&mut self) {
        self.http = None;
        self.connection_id = None;
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }
}
