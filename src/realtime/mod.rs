//! Realtime notification channel.
//!
//! [`RealtimeClient`] is the entry point. It composes a [`Transport`], the
//! [`SessionRegistry`] and the event [`Dispatcher`].

pub mod client;
pub mod events;
pub mod proto;
pub mod registry;
pub mod transport;

pub use client::{ConnectionState, RealtimeClient, RealtimeError};
pub use events::{classify, Callback, CallbackRegistry, Dispatcher, EventKind, Route, UnknownEventKind};
pub use proto::{InboundFrame, OutboundEvent, ProtocolError};
pub use registry::{SessionRecord, SessionRegistry, SessionStatus, SessionUpdate};
pub use transport::{BridgeTransport, SocketIoTransport, Transport, TransportError};
