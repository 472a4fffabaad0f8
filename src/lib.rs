//! Rust SDK for SunuID QR challenges and their realtime notifications.
//!
//! The crate is organized by surface:
//! - `service`: the [`ChallengeService`] façade used by host applications.
//! - `api`: HTTP client for the challenge API (`/qr-generate`, `/qr-status`, `/debug`).
//! - `realtime`: Socket.IO relay client, session registry and event dispatch.
//! - `config`: SDK and channel configuration with validation.
//! - `retry`: shared retry, backoff and timeout utilities.

/// Challenge API client and request/response types.
pub mod api;
/// SDK and realtime channel configuration.
pub mod config;
/// Realtime relay client, transports and session tracking.
pub mod realtime;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// High-level challenge service.
pub mod service;

pub use config::{ChallengeType, ChannelConfig, ConfigError, ProtocolVersion, SdkConfig, TransportKind};
pub use realtime::{ConnectionState, EventKind, RealtimeClient, SessionRecord, SessionStatus};
pub use service::{ChallengeError, ChallengeService, Envelope, PartnerInfo, QrChallenge};
