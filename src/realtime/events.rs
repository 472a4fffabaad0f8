//! Event kinds, callback registry and inbound dispatch.
//!
//! The [`Dispatcher`] owns the session registry and the callback registry
//! behind a single mutex. Callbacks run after the lock is released, so a
//! callback may read sessions or disconnect the client.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::value_to_string;
use crate::realtime::proto::InboundFrame;
use crate::realtime::registry::{SessionRecord, SessionRegistry, SessionStatus, SessionUpdate};

/// Closed set of events delivered to user callbacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Error,
    AuthSuccess,
    AuthFailure,
    KycComplete,
    KycPending,
    SessionExpired,
}

impl EventKind {
    pub const ALL: [Self; 9] = [
        Self::Connect,
        Self::Disconnect,
        Self::Message,
        Self::Error,
        Self::AuthSuccess,
        Self::AuthFailure,
        Self::KycComplete,
        Self::KycPending,
        Self::SessionExpired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Message => "message",
            Self::Error => "error",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::KycComplete => "kyc_complete",
            Self::KycPending => "kyc_pending",
            Self::SessionExpired => "session_expired",
        }
    }

    /// Kinds that a relay message may select through its tag.
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "auth_success" => Some(Self::AuthSuccess),
            "auth_failure" => Some(Self::AuthFailure),
            "kyc_complete" => Some(Self::KycComplete),
            "kyc_pending" => Some(Self::KycPending),
            "session_expired" => Some(Self::SessionExpired),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown event kind {0:?}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// User callback invoked with the raw event payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Ordered callback lists per [`EventKind`].
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<EventKind, Vec<Callback>>,
}

impl CallbackRegistry {
    pub fn register(&mut self, kind: EventKind, callback: Callback) {
        self.callbacks.entry(kind).or_default().push(callback);
    }

    /// Callbacks for `kind` in registration order.
    pub fn callbacks_for(&self, kind: EventKind) -> Vec<Callback> {
        self.callbacks.get(&kind).cloned().unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.callbacks.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<_, _> = self
            .callbacks
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &counts)
            .finish()
    }
}

/// How an inbound frame is routed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// Liveness traffic, handled internally.
    Heartbeat,
    Event(EventKind),
}

/// Routes a frame by its payload `type` tag, then by its Socket.IO event
/// name. Anything unrecognised is a generic `message`.
pub fn classify(frame: &InboundFrame) -> Route {
    let tags = [frame.message_type(), Some(frame.event.as_str())];
    for tag in tags.into_iter().flatten() {
        if tag == "heartbeat" {
            return Route::Heartbeat;
        }
        if let Some(kind) = EventKind::from_tag(tag) {
            return Route::Event(kind);
        }
    }
    Route::Event(EventKind::Message)
}

#[derive(Debug, Default)]
struct DispatchState {
    sessions: SessionRegistry,
    callbacks: CallbackRegistry,
}

/// Session and callback state shared by the realtime client and its worker.
#[derive(Debug, Default)]
pub struct Dispatcher {
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, callback: Callback) {
        self.lock().callbacks.register(kind, callback);
    }

    pub fn callback_count(&self, kind: EventKind) -> usize {
        self.lock().callbacks.count(kind)
    }

    /// Applies an inbound frame to the session registry and notifies
    /// callbacks. Heartbeats are returned to the caller untouched.
    pub fn dispatch(&self, frame: &InboundFrame) -> Route {
        let route = classify(frame);
        let Route::Event(kind) = route else {
            debug!(event = "realtime_heartbeat_received");
            return route;
        };

        let payload = &frame.payload;
        let callbacks = {
            let mut state = self.lock();
            if let Some(session_id) = payload.get("session_id").and_then(value_to_string) {
                apply_session_effect(&mut state.sessions, kind, &session_id, payload);
            }
            state.callbacks.callbacks_for(kind)
        };

        debug!(
            event = "realtime_event_dispatched",
            kind = %kind,
            callbacks = callbacks.len()
        );
        invoke_all(kind, &callbacks, payload);
        route
    }

    /// Notifies callbacks for a lifecycle event without touching sessions.
    pub fn emit(&self, kind: EventKind, payload: &Value) {
        let callbacks = self.lock().callbacks.callbacks_for(kind);
        invoke_all(kind, &callbacks, payload);
    }

    /// Runs `f` with exclusive access to the session registry.
    pub fn with_sessions<R>(&self, f: impl FnOnce(&mut SessionRegistry) -> R) -> R {
        f(&mut self.lock().sessions)
    }

    pub fn sessions(&self) -> BTreeMap<String, SessionRecord> {
        self.lock().sessions.list()
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_session_effect(
    sessions: &mut SessionRegistry,
    kind: EventKind,
    session_id: &str,
    payload: &Value,
) {
    let update = match kind {
        EventKind::AuthSuccess => {
            let update = SessionUpdate::status(SessionStatus::Authenticated);
            match payload.get("user_id").filter(|value| !value.is_null()) {
                Some(user_id) => update.with_user_id(user_id.clone()),
                None => update,
            }
        }
        EventKind::AuthFailure => SessionUpdate::status(SessionStatus::Failed).with_reason(
            payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        ),
        EventKind::KycComplete => SessionUpdate::status(SessionStatus::KycComplete).with_kyc_data(
            payload
                .get("kyc_data")
                .cloned()
                .unwrap_or_else(|| json!({})),
        ),
        EventKind::KycPending => SessionUpdate::status(SessionStatus::KycPending)
            .with_pending_steps(
                payload
                    .get("pending_steps")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            ),
        EventKind::SessionExpired => {
            if sessions.remove(session_id).is_some() {
                debug!(event = "realtime_session_expired", session_id);
            }
            return;
        }
        EventKind::Connect | EventKind::Disconnect | EventKind::Message | EventKind::Error => {
            return
        }
    };

    let record = sessions.upsert(session_id, update.with_event_data(payload.clone()));
    debug!(
        event = "realtime_session_updated",
        session_id,
        status = %record.status
    );
}

fn invoke_all(kind: EventKind, callbacks: &[Callback], payload: &Value) {
    for (index, callback) in callbacks.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
            warn!(event = "realtime_callback_panicked", kind = %kind, index);
        }
    }
}
