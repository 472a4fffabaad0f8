//! Socket.IO wire codec and the application frames exchanged with the relay.
//!
//! Two layers are handled here:
//! - Engine.IO packets (`0` open, `2` ping, `3` pong, `4` message, ...) and the
//!   long-polling payload framing of Engine.IO 3 and 4.
//! - Socket.IO packets carried inside Engine.IO messages (`0` connect,
//!   `2` event, `4` connect error, ...).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Engine.IO 4 record separator used between polling packets.
const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty packet")]
    Empty,

    #[error("unknown {layer} packet type {kind:?}")]
    UnknownType { layer: &'static str, kind: char },

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),
}

/// Handshake data carried by the Engine.IO open packet.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct OpenInfo {
    pub sid: String,
    #[serde(rename = "pingInterval", default)]
    pub ping_interval_ms: u64,
    #[serde(rename = "pingTimeout", default)]
    pub ping_timeout_ms: u64,
    #[serde(default)]
    pub upgrades: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Self::Open)
                .map_err(|err| ProtocolError::Malformed(format!("open payload: {err}"))),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(rest.to_string())),
            '3' => Ok(Self::Pong(rest.to_string())),
            '4' => Ok(Self::Message(rest.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(ProtocolError::UnknownType {
                layer: "engine.io",
                kind: other,
            }),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(info) => format!("0{}", json!(info)),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        payload: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        payload: Value,
    },
}

impl SocketPacket {
    /// Builds an event on the default namespace.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            namespace: "/".to_string(),
            ack_id: None,
            name: name.into(),
            args: vec![payload],
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let (namespace, rest) = split_namespace(chars.as_str());

        match kind {
            '0' => Ok(Self::Connect {
                namespace,
                payload: parse_optional_json(rest)?,
            }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let (ack_id, rest) = split_ack_id(rest);
                let mut args = parse_args(rest)?;
                if args.is_empty() {
                    return Err(ProtocolError::Malformed("event without name".to_string()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(ProtocolError::Malformed(format!(
                            "event name must be a string, got {other}"
                        )))
                    }
                };
                Ok(Self::Event {
                    namespace,
                    ack_id,
                    name,
                    args,
                })
            }
            '3' => {
                let (ack_id, rest) = split_ack_id(rest);
                let ack_id = ack_id
                    .ok_or_else(|| ProtocolError::Malformed("ack without id".to_string()))?;
                Ok(Self::Ack {
                    namespace,
                    ack_id,
                    args: parse_args(rest)?,
                })
            }
            '4' => Ok(Self::ConnectError {
                namespace,
                payload: parse_optional_json(rest)?.unwrap_or(Value::Null),
            }),
            '5' | '6' => Err(ProtocolError::Unsupported("binary packets")),
            other => Err(ProtocolError::UnknownType {
                layer: "socket.io",
                kind: other,
            }),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect { namespace, payload } => {
                let body = payload.as_ref().map(Value::to_string).unwrap_or_default();
                format!("0{}{body}", namespace_prefix(namespace, !body.is_empty()))
            }
            Self::Disconnect { namespace } => format!("1{}", namespace_prefix(namespace, false)),
            Self::Event {
                namespace,
                ack_id,
                name,
                args,
            } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                format!(
                    "2{}{}{}",
                    namespace_prefix(namespace, true),
                    ack_id.map(|id| id.to_string()).unwrap_or_default(),
                    Value::Array(items)
                )
            }
            Self::Ack {
                namespace,
                ack_id,
                args,
            } => format!(
                "3{}{ack_id}{}",
                namespace_prefix(namespace, true),
                Value::Array(args.clone())
            ),
            Self::ConnectError { namespace, payload } => {
                format!("4{}{payload}", namespace_prefix(namespace, true))
            }
        }
    }

    /// Wraps the packet into an Engine.IO message frame.
    pub fn to_engine_text(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn namespace_prefix(namespace: &str, followed_by_data: bool) -> String {
    if namespace.is_empty() || namespace == "/" {
        String::new()
    } else if followed_by_data {
        format!("{namespace},")
    } else {
        namespace.to_string()
    }
}

fn split_namespace(rest: &str) -> (String, &str) {
    if !rest.starts_with('/') {
        return ("/".to_string(), rest);
    }
    match rest.find(',') {
        Some(idx) => (rest[..idx].to_string(), &rest[idx + 1..]),
        None => (rest.to_string(), ""),
    }
}

fn split_ack_id(rest: &str) -> (Option<u64>, &str) {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, rest);
    }
    (rest[..digits].parse().ok(), &rest[digits..])
}

fn parse_optional_json(rest: &str) -> Result<Option<Value>, ProtocolError> {
    if rest.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(rest)
        .map(Some)
        .map_err(|err| ProtocolError::Malformed(err.to_string()))
}

fn parse_args(rest: &str) -> Result<Vec<Value>, ProtocolError> {
    match parse_optional_json(rest)? {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(ProtocolError::Malformed(format!(
            "expected argument array, got {other}"
        ))),
    }
}

/// Splits an Engine.IO long-polling response body into packets.
///
/// Engine.IO 3 prefixes each packet with `<length>:`, counted in UTF-16 code
/// units; Engine.IO 4 separates packets with the ASCII record separator.
pub fn decode_payload(revision: u8, body: &str) -> Result<Vec<String>, ProtocolError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if revision >= 4 {
        return Ok(body
            .split(RECORD_SEPARATOR)
            .filter(|packet| !packet.is_empty())
            .map(str::to_string)
            .collect());
    }

    let mut packets = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| ProtocolError::Malformed("missing length prefix".to_string()))?;
        let len: usize = rest[..colon]
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("bad length {:?}", &rest[..colon])))?;
        let data = &rest[colon + 1..];
        let byte_len = utf16_prefix_len(data, len)?;
        packets.push(data[..byte_len].to_string());
        rest = &data[byte_len..];
    }
    Ok(packets)
}

/// Joins packets into an Engine.IO long-polling request body.
pub fn encode_payload(revision: u8, packets: &[String]) -> String {
    if revision >= 4 {
        let separator = RECORD_SEPARATOR.to_string();
        return packets.join(&separator);
    }
    packets
        .iter()
        .map(|packet| format!("{}:{packet}", packet.encode_utf16().count()))
        .collect()
}

/// Byte length of the prefix of `data` spanning `units` UTF-16 code units.
fn utf16_prefix_len(data: &str, units: usize) -> Result<usize, ProtocolError> {
    let mut counted = 0;
    for (idx, ch) in data.char_indices() {
        if counted == units {
            return Ok(idx);
        }
        counted += ch.len_utf16();
        if counted > units {
            return Err(ProtocolError::Malformed(
                "length prefix splits a character".to_string(),
            ));
        }
    }
    if counted == units {
        Ok(data.len())
    } else {
        Err(ProtocolError::Malformed("truncated payload".to_string()))
    }
}

/// Application message received from the relay.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundFrame {
    /// Socket.IO event name the relay emitted.
    pub event: String,
    /// Event payload as sent by the relay.
    pub payload: Value,
}

impl InboundFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Builds a frame from Socket.IO event arguments.
    ///
    /// A single argument becomes the payload; a single string argument that
    /// holds a JSON object is decoded. Zero arguments yield `null` and several
    /// arguments are kept as an array.
    pub fn from_event(name: String, mut args: Vec<Value>) -> Self {
        let payload = match args.len() {
            0 => Value::Null,
            1 => match args.remove(0) {
                Value::String(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(parsed @ Value::Object(_)) => parsed,
                    _ => Value::String(text),
                },
                other => other,
            },
            _ => Value::Array(args),
        };
        Self::new(name, payload)
    }

    /// The explicit `type` tag of the payload, if any.
    pub fn message_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

/// Named event sent to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub event: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn subscribe(session_id: &str) -> Self {
        Self::new("subscribe", json!({ "session_id": session_id }))
    }

    pub fn unsubscribe(session_id: &str) -> Self {
        Self::new("unsubscribe", json!({ "session_id": session_id }))
    }

    pub fn heartbeat(timestamp: u64) -> Self {
        Self::new(
            "heartbeat",
            json!({ "type": "heartbeat", "timestamp": timestamp }),
        )
    }

    /// Registration event binding the connection id to the partner identity.
    ///
    /// `extra` fields are merged last and may override the defaults.
    pub fn register(event: &str, sid: &str, timestamp: u64, extra: &Map<String, Value>) -> Self {
        let mut data = Map::new();
        data.insert("sid".to_string(), Value::from(sid));
        data.insert("ts".to_string(), Value::from(timestamp));
        data.insert("source".to_string(), Value::from("rust-sdk"));
        for (key, value) in extra {
            data.insert(key.clone(), value.clone());
        }
        Self::new(event, Value::Object(data))
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;

    #[test]
    fn open_packet_exposes_sid_and_ping_timing() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"abc123","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#,
        )
        .expect("decode open");
        match packet {
            EnginePacket::Open(info) => {
                assert_eq!(info.sid, "abc123");
                assert_eq!(info.ping_interval_ms, 25000);
                assert_eq!(info.ping_timeout_ms, 20000);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn event_with_namespace_and_ack_id_decodes() {
        let packet =
            SocketPacket::decode(r#"2/admin,12["auth_success",{"session_id":"s1"}]"#).expect("decode");
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/admin".to_string(),
                ack_id: Some(12),
                name: "auth_success".to_string(),
                args: vec![json!({"session_id": "s1"})],
            }
        );
    }

    #[test]
    fn event_encodes_for_default_namespace() {
        let packet = SocketPacket::event("subscribe", json!({"session_id": "s1"}));
        assert_eq!(packet.to_engine_text(), r#"42["subscribe",{"session_id":"s1"}]"#);
    }

    #[test]
    fn connect_ack_carries_socket_id() {
        match SocketPacket::decode(r#"0{"sid":"sock-9"}"#).expect("decode") {
            SocketPacket::Connect { namespace, payload } => {
                assert_eq!(namespace, "/");
                assert_eq!(payload, Some(json!({"sid": "sock-9"})));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        assert_eq!(
            SocketPacket::Connect {
                namespace: "/".to_string(),
                payload: None
            }
            .encode(),
            "0"
        );
    }

    #[test]
    fn binary_and_unknown_packets_are_rejected() {
        assert_eq!(
            SocketPacket::decode("51-[\"x\"]"),
            Err(ProtocolError::Unsupported("binary packets"))
        );
        assert!(matches!(
            EnginePacket::decode("9"),
            Err(ProtocolError::UnknownType { .. })
        ));
        assert_eq!(EnginePacket::decode(""), Err(ProtocolError::Empty));
    }

    #[test]
    fn polling_payloads_split_per_revision() {
        let v4 = decode_payload(4, "40\u{1e}42[\"a\",1]").expect("v4");
        assert_eq!(v4, vec!["40".to_string(), "42[\"a\",1]".to_string()]);

        let v3 = decode_payload(3, "2:406:42[1,2]").expect("v3");
        assert_eq!(v3, vec!["40".to_string(), "42[1,2]".to_string()]);

        assert!(decode_payload(3, "9:40").is_err());
        assert_eq!(encode_payload(3, &v3), "2:406:42[1,2]");
        assert_eq!(encode_payload(4, &v4), "40\u{1e}42[\"a\",1]");
    }

    #[test]
    fn v3_lengths_count_utf16_units() {
        let packets = vec!["42[\"😀\"]".to_string(), "3é".to_string()];
        let body = encode_payload(3, &packets);
        assert_eq!(body, "8:42[\"😀\"]2:3é");
        assert_eq!(decode_payload(3, &body).expect("v3"), packets);

        assert!(decode_payload(3, "4:42\"😀").is_err());
        assert!(decode_payload(3, "6:42[\"😀\"]").is_err());
    }

    #[test]
    fn inbound_frame_decodes_stringified_payloads() {
        let frame = InboundFrame::from_event(
            "message".to_string(),
            vec![Value::String(r#"{"type":"kyc_pending","session_id":"s"}"#.to_string())],
        );
        assert_eq!(frame.message_type(), Some("kyc_pending"));

        let plain = InboundFrame::from_event("message".to_string(), vec![json!("hello")]);
        assert_eq!(plain.payload, json!("hello"));
        assert_eq!(plain.message_type(), None);
    }

    #[test]
    fn register_event_merges_extra_fields() {
        let mut extra = Map::new();
        extra.insert("partner".to_string(), json!("Fayma"));
        extra.insert("source".to_string(), json!("custom"));
        let event = OutboundEvent::register("register_sid", "sid-1", 100, &extra);
        assert_eq!(event.event, "register_sid");
        assert_eq!(
            event.data,
            json!({"sid": "sid-1", "ts": 100, "source": "custom", "partner": "Fayma"})
        );
    }
}
