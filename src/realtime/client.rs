//! Realtime client facade.
//!
//! [`RealtimeClient`] owns one relay connection through a background worker
//! task. The worker drives the transport, dispatches inbound frames, emits
//! heartbeats and reconnects with linear backoff after unexpected loss.
//! Commands reach the worker through an unbounded queue; dropping the queue
//! sender (on [`RealtimeClient::disconnect`] or when the last handle is
//! dropped) shuts the worker down.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, ConfigError};
use crate::realtime::events::{Dispatcher, EventKind, Route, UnknownEventKind};
use crate::realtime::proto::{unix_now, OutboundEvent};
use crate::realtime::registry::{SessionRecord, SessionRegistry};
use crate::realtime::transport::{SocketIoTransport, Transport, TransportError};
use crate::retry::{linear_delay, with_timeout};

/// Lifecycle of a realtime connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    UnknownEvent(#[from] UnknownEventKind),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Cloneable handle to one realtime connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ChannelConfig>,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundEvent>>>,
    transport: tokio::sync::Mutex<TransportSlot>,
}

enum TransportSlot {
    Idle(Box<dyn Transport>),
    Running(JoinHandle<Box<dyn Transport>>),
    Lost,
}

/// State touched by both the client handle and the worker.
#[derive(Default)]
struct Shared {
    dispatcher: Dispatcher,
    link: Mutex<LinkStatus>,
}

struct LinkStatus {
    state: ConnectionState,
    connection_id: Option<String>,
    last_error: Option<String>,
    ever_connected: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            connection_id: None,
            last_error: None,
            ever_connected: false,
        }
    }
}

impl RealtimeClient {
    /// Creates a client speaking Socket.IO to the configured relay.
    pub fn new(config: ChannelConfig) -> Result<Self, RealtimeError> {
        Self::with_transport(config, Box::new(SocketIoTransport::new()))
    }

    /// Creates a client over a caller-supplied transport.
    pub fn with_transport(
        config: ChannelConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, RealtimeError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                shared: Arc::new(Shared::default()),
                outbound: Mutex::new(None),
                transport: tokio::sync::Mutex::new(TransportSlot::Idle(transport)),
            }),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Opens the relay connection.
    ///
    /// Resolves once the handshake succeeded (`true`) or failed (`false`).
    /// Failures are also reported through `error` callbacks and
    /// [`last_error`](Self::last_error). A running reconnect loop is replaced
    /// by a fresh connection attempt.
    pub async fn connect(&self) -> bool {
        let mut slot = self.inner.transport.lock().await;
        if self.is_connected() {
            return true;
        }

        drop(lock(&self.inner.outbound).take());
        let transport = match std::mem::replace(&mut *slot, TransportSlot::Lost) {
            TransportSlot::Idle(transport) => transport,
            TransportSlot::Running(handle) => match handle.await {
                Ok(transport) => transport,
                Err(err) => {
                    self.inner
                        .shared
                        .fail(format!("realtime worker stopped abnormally: {err}"));
                    return false;
                }
            },
            TransportSlot::Lost => {
                self.inner
                    .shared
                    .fail("realtime transport is no longer available".to_string());
                return false;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        *lock(&self.inner.outbound) = Some(outbound_tx);
        self.inner.shared.set_state(ConnectionState::Connecting);

        let handle = tokio::spawn(connection_worker(
            Arc::clone(&self.inner.shared),
            Arc::clone(&self.inner.config),
            transport,
            outbound_rx,
            ready_tx,
        ));
        *slot = TransportSlot::Running(handle);

        ready_rx.await.unwrap_or(false)
    }

    /// Closes the connection and cancels any pending reconnect.
    ///
    /// Idempotent and safe to call from inside a callback.
    pub fn disconnect(&self) {
        if lock(&self.inner.outbound).take().is_some() {
            info!(event = "realtime_disconnect_requested");
        }
        self.inner.shared.mark_disconnected();
    }

    /// Subscribes to events for `session_id`.
    ///
    /// The session is recorded as subscribed before the event is queued, under
    /// the dispatcher lock, so a relay reply can never be overwritten by it.
    /// Returns `false` without sending when not connected.
    pub fn subscribe(&self, session_id: &str) -> bool {
        let sent = self.inner.shared.dispatcher.with_sessions(|sessions| {
            let created = sessions.mark_subscribed(session_id, unix_now());
            let sent = self.enqueue(OutboundEvent::subscribe(session_id));
            if !sent && created {
                sessions.remove(session_id);
            }
            sent
        });
        if sent {
            debug!(event = "realtime_session_subscribed", session_id);
        }
        sent
    }

    pub fn unsubscribe(&self, session_id: &str) -> bool {
        if !self.enqueue(OutboundEvent::unsubscribe(session_id)) {
            return false;
        }
        self.inner.shared.dispatcher.with_sessions(|sessions| {
            sessions.remove(session_id);
        });
        debug!(event = "realtime_session_unsubscribed", session_id);
        true
    }

    /// Emits `message["event"]` (default `"message"`) carrying
    /// `message["data"]`, or the whole message when it has no `data` field.
    pub fn send_message(&self, message: &Value) -> bool {
        let event = message
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("message");
        let data = message.get("data").unwrap_or(message).clone();
        self.send(event, data)
    }

    pub fn send(&self, event: &str, data: Value) -> bool {
        self.enqueue(OutboundEvent::new(event, data))
    }

    /// Registers a callback for `kind`. Callbacks run in registration order.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.shared.dispatcher.on(kind, Arc::new(callback));
    }

    /// Registers a callback by event name, rejecting unknown names.
    pub fn on_named<F>(&self, name: &str, callback: F) -> Result<(), RealtimeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        match name.parse::<EventKind>() {
            Ok(kind) => {
                self.on(kind, callback);
                Ok(())
            }
            Err(err) => {
                warn!(event = "realtime_unknown_event_kind", name);
                Err(err.into())
            }
        }
    }

    /// Snapshot of the tracked sessions.
    pub fn active_sessions(&self) -> BTreeMap<String, SessionRecord> {
        self.inner.shared.dispatcher.sessions()
    }

    /// Runs `f` against the live session registry.
    pub fn with_sessions<R>(&self, f: impl FnOnce(&SessionRegistry) -> R) -> R {
        self.inner
            .shared
            .dispatcher
            .with_sessions(|sessions| f(sessions))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.link().state
    }

    /// Relay-issued id of the current connection.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.shared.link().connection_id.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.link().last_error.clone()
    }

    fn enqueue(&self, event: OutboundEvent) -> bool {
        if !self.is_connected() {
            debug!(event = "realtime_send_skipped", name = %event.event);
            return false;
        }
        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, LinkStatus> {
        lock(&self.link)
    }

    fn set_state(&self, state: ConnectionState) {
        self.link().state = state;
    }

    fn mark_connected(&self, connection_id: &str) {
        let mut link = self.link();
        link.state = ConnectionState::Connected;
        link.connection_id = Some(connection_id.to_string());
        link.ever_connected = true;
    }

    fn mark_disconnected(&self) {
        let mut link = self.link();
        link.state = ConnectionState::Disconnected;
        link.connection_id = None;
    }

    /// Records a connection failure and notifies `error` callbacks.
    fn fail(&self, message: String) {
        {
            let mut link = self.link();
            link.state = if link.ever_connected {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Idle
            };
            link.connection_id = None;
            link.last_error = Some(message.clone());
        }
        warn!(event = "realtime_error", error = %message);
        self.dispatcher
            .emit(EventKind::Error, &json!({ "error": message }));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum SessionOutcome {
    GracefulShutdown,
    Lost(TransportError),
}

async fn connection_worker(
    shared: Arc<Shared>,
    config: Arc<ChannelConfig>,
    mut transport: Box<dyn Transport>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    ready_tx: oneshot::Sender<bool>,
) -> Box<dyn Transport> {
    let mut ready_tx = Some(ready_tx);
    let mut pending = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        match establish(&shared, &config, transport.as_mut(), &outbound_rx).await {
            Ok(()) => {
                attempt = 0;
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(true);
                }

                let outcome =
                    run_session(&shared, &config, transport.as_mut(), &mut outbound_rx, &mut pending)
                        .await;
                transport.close().await;
                match outcome {
                    SessionOutcome::GracefulShutdown => {
                        shared.mark_disconnected();
                        break;
                    }
                    SessionOutcome::Lost(err) => {
                        shared.mark_disconnected();
                        warn!(event = "realtime_connection_lost", error = %err);
                        shared.dispatcher.emit(
                            EventKind::Disconnect,
                            &json!({ "code": disconnect_code(&err), "reason": err.to_string() }),
                        );
                        if !config.reconnect_enabled() {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                transport.close().await;
                if outbound_rx.is_closed() {
                    shared.mark_disconnected();
                    break;
                }
                shared.fail(err.to_string());
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(false);
                    if !(config.reconnect_on_initial_failure && config.reconnect_enabled()) {
                        break;
                    }
                }
            }
        }

        if outbound_rx.is_closed() {
            shared.mark_disconnected();
            break;
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            shared.fail(format!(
                "reconnect attempts exhausted after {} tries",
                config.max_reconnect_attempts
            ));
            break;
        }

        let delay = linear_delay(config.reconnect_interval, attempt);
        shared.set_state(ConnectionState::Reconnecting { attempt });
        info!(
            event = "realtime_reconnect_scheduled",
            attempt,
            max_attempts = config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !collect_events_during_delay(delay, &mut outbound_rx, &mut pending).await {
            shared.mark_disconnected();
            break;
        }
    }

    debug!(event = "realtime_worker_stopped");
    transport
}

/// Connects the transport, announces the connection and registers its id.
async fn establish(
    shared: &Shared,
    config: &ChannelConfig,
    transport: &mut dyn Transport,
    outbound_rx: &mpsc::UnboundedReceiver<OutboundEvent>,
) -> Result<(), TransportError> {
    let budget = handshake_budget(config);
    let connection_id = with_timeout(budget, transport.connect(config))
        .await
        .map_err(|_| TransportError::Timeout(budget))??;
    if outbound_rx.is_closed() {
        return Err(TransportError::Closed("disconnect requested".to_string()));
    }

    shared.mark_connected(&connection_id);
    info!(event = "realtime_connected", connection_id = %connection_id);
    shared
        .dispatcher
        .emit(EventKind::Connect, &json!({ "socket_id": connection_id }));

    if config.auto_register_sid {
        let register = OutboundEvent::register(
            &config.register_event_name,
            &connection_id,
            unix_now(),
            &config.register_payload_extra,
        );
        match transport.send(&register).await {
            Ok(()) => debug!(event = "realtime_sid_registered", connection_id = %connection_id),
            Err(err) => warn!(event = "realtime_sid_register_failed", error = %err),
        }
    }
    Ok(())
}

async fn run_session(
    shared: &Shared,
    config: &ChannelConfig,
    transport: &mut dyn Transport,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    pending: &mut VecDeque<OutboundEvent>,
) -> SessionOutcome {
    while let Some(event) = pending.pop_front() {
        if let Err(err) = transport.send(&event).await {
            pending.push_front(event);
            return SessionOutcome::Lost(err);
        }
    }

    let mut heartbeat = config.heartbeat().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            maybe_event = outbound_rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        if let Err(err) = transport.send(&event).await {
                            pending.push_front(event);
                            return SessionOutcome::Lost(err);
                        }
                    }
                    None => return SessionOutcome::GracefulShutdown,
                }
            }
            inbound = transport.receive() => {
                match inbound {
                    Ok(frame) => {
                        if shared.dispatcher.dispatch(&frame) == Route::Heartbeat {
                            if let Err(err) = transport.send(&OutboundEvent::heartbeat(unix_now())).await {
                                return SessionOutcome::Lost(err);
                            }
                        }
                    }
                    Err(err) => return SessionOutcome::Lost(err),
                }
            }
            _ = next_tick(&mut heartbeat) => {
                debug!(event = "realtime_heartbeat_sent");
                if let Err(err) = transport.send(&OutboundEvent::heartbeat(unix_now())).await {
                    return SessionOutcome::Lost(err);
                }
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Waits out a reconnect delay while still accepting queued events.
///
/// Returns `false` when the command queue closed.
async fn collect_events_during_delay(
    delay: Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    pending: &mut VecDeque<OutboundEvent>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_event = outbound_rx.recv() => {
                match maybe_event {
                    Some(event) => pending.push_back(event),
                    None => return false,
                }
            }
        }
    }
}

/// Upper bound for one handshake across every configured transport kind.
fn handshake_budget(config: &ChannelConfig) -> Duration {
    let kinds = u32::try_from(config.transports.len().max(1)).unwrap_or(u32::MAX);
    config.connection_timeout.saturating_mul(kinds)
}

fn disconnect_code(err: &TransportError) -> u16 {
    match err {
        TransportError::Closed(_) => 1000,
        _ => 1006,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::{ConnectionState, RealtimeClient};
    use crate::config::ChannelConfig;
    use crate::realtime::events::EventKind;
    use crate::realtime::proto::{InboundFrame, OutboundEvent};
    use crate::realtime::registry::SessionStatus;
    use crate::realtime::transport::{Transport, TransportError};

    type Feed = mpsc::UnboundedSender<Result<InboundFrame, TransportError>>;

    /// In-memory transport following a scripted list of connect results.
    struct ScriptedTransport {
        connects: Arc<Mutex<VecDeque<Result<String, TransportError>>>>,
        connect_calls: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<OutboundEvent>>>,
        inbound: mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>,
        connection_id: Option<String>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self, _config: &ChannelConfig) -> Result<String, TransportError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .connects
                .lock()
                .expect("script")
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Rejected("script exhausted".to_string())));
            let id = next?;
            self.connection_id = Some(id.clone());
            Ok(id)
        }

        async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError> {
            if self.connection_id.is_none() {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().expect("sent").push(event.clone());
            Ok(())
        }

        async fn receive(&mut self) -> Result<InboundFrame, TransportError> {
            if self.connection_id.is_none() {
                return Err(TransportError::NotConnected);
            }
            match self.inbound.recv().await {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.connection_id = None;
        }

        fn connection_id(&self) -> Option<&str> {
            self.connection_id.as_deref()
        }
    }

    struct Harness {
        client: RealtimeClient,
        feed: Feed,
        sent: Arc<Mutex<Vec<OutboundEvent>>>,
        connect_calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(config: ChannelConfig, script: Vec<Result<String, TransportError>>) -> Self {
            let (feed, inbound) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            let connect_calls = Arc::new(AtomicUsize::new(0));
            let transport = ScriptedTransport {
                connects: Arc::new(Mutex::new(script.into())),
                connect_calls: Arc::clone(&connect_calls),
                sent: Arc::clone(&sent),
                inbound,
                connection_id: None,
            };
            let client = RealtimeClient::with_transport(config, Box::new(transport)).expect("client");
            Self {
                client,
                feed,
                sent,
                connect_calls,
            }
        }

        fn push(&self, payload: Value) {
            self.feed
                .send(Ok(InboundFrame::new("message", payload)))
                .expect("feed");
        }

        fn drop_connection(&self) {
            self.feed
                .send(Err(TransportError::Closed("test drop".to_string())))
                .expect("feed");
        }

        fn sent_named(&self, name: &str) -> Vec<OutboundEvent> {
            self.sent
                .lock()
                .expect("sent")
                .iter()
                .filter(|event| event.event == name)
                .cloned()
                .collect()
        }

        fn connects(&self) -> usize {
            self.connect_calls.load(Ordering::SeqCst)
        }
    }

    fn test_config() -> ChannelConfig {
        ChannelConfig::new("http://relay.test")
            .with_reconnect(Duration::from_millis(5), 2)
            .with_heartbeat_interval(Duration::ZERO)
    }

    fn ok(id: &str) -> Result<String, TransportError> {
        Ok(id.to_string())
    }

    fn refused() -> Result<String, TransportError> {
        Err(TransportError::Rejected("handshake refused".to_string()))
    }

    fn recorder(client: &RealtimeClient, kind: EventKind) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.on(kind, move |payload: &Value| {
            sink.lock().expect("seen").push(payload.clone())
        });
        seen
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn connect_fires_callbacks_and_registers_once() {
        let harness = Harness::new(test_config(), vec![ok("sid-1")]);
        let connected = recorder(&harness.client, EventKind::Connect);

        assert!(harness.client.connect().await);
        assert!(harness.client.is_connected());
        assert_eq!(harness.client.connection_id().as_deref(), Some("sid-1"));
        assert_eq!(*connected.lock().expect("seen"), vec![json!({"socket_id": "sid-1"})]);

        let registrations = harness.sent_named("register_sid");
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].data["sid"], json!("sid-1"));
        assert_eq!(registrations[0].data["source"], json!("rust-sdk"));

        // Already connected: no second handshake.
        assert!(harness.client.connect().await);
        assert_eq!(harness.connects(), 1);
        assert_eq!(harness.sent_named("register_sid").len(), 1);
    }

    #[tokio::test]
    async fn auto_register_can_be_disabled() {
        let config = test_config().with_auto_register(false, Default::default());
        let harness = Harness::new(config, vec![ok("sid-1")]);
        assert!(harness.client.connect().await);
        assert!(harness.sent_named("register_sid").is_empty());
    }

    #[tokio::test]
    async fn operations_return_false_while_not_connected() {
        let harness = Harness::new(test_config(), vec![]);
        assert!(!harness.client.subscribe("s1"));
        assert!(!harness.client.unsubscribe("s1"));
        assert!(!harness.client.send_message(&json!({"event": "ping", "data": {}})));
        assert!(!harness.client.send("custom", json!({})));
        assert!(harness.sent.lock().expect("sent").is_empty());
        assert!(harness.client.active_sessions().is_empty());
        assert_eq!(harness.client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn session_lifecycle_follows_relay_events() {
        let harness = Harness::new(test_config(), vec![ok("sid-1")]);
        let auth = recorder(&harness.client, EventKind::AuthSuccess);
        assert!(harness.client.connect().await);

        assert!(harness.client.subscribe("sessA"));
        assert_eq!(
            harness.client.active_sessions()["sessA"].status,
            SessionStatus::Subscribed
        );
        eventually("subscribe event", || !harness.sent_named("subscribe").is_empty()).await;
        assert_eq!(
            harness.sent_named("subscribe")[0].data,
            json!({"session_id": "sessA"})
        );

        let payload = json!({"type": "auth_success", "session_id": "sessA", "user_id": "U1"});
        harness.push(payload.clone());
        eventually("auth callback", || !auth.lock().expect("auth").is_empty()).await;
        let record = harness.client.active_sessions()["sessA"].clone();
        assert_eq!(record.status, SessionStatus::Authenticated);
        assert_eq!(record.user_id, Some(json!("U1")));
        assert_eq!(*auth.lock().expect("auth"), vec![payload]);

        harness.push(json!({"type": "session_expired", "session_id": "sessA"}));
        eventually("expiry", || harness.client.active_sessions().is_empty()).await;

        assert!(harness.client.subscribe("sessB"));
        assert!(harness.client.unsubscribe("sessB"));
        assert!(!harness.client.active_sessions().contains_key("sessB"));
    }

    #[tokio::test]
    async fn send_message_defaults_event_and_data() {
        let harness = Harness::new(test_config(), vec![ok("sid-1")]);
        assert!(harness.client.connect().await);

        assert!(harness.client.send_message(&json!({"text": "hi"})));
        assert!(harness.client.send_message(&json!({"event": "custom", "data": [1, 2]})));
        eventually("messages", || harness.sent_named("custom").len() == 1).await;

        assert_eq!(harness.sent_named("message")[0].data, json!({"text": "hi"}));
        assert_eq!(harness.sent_named("custom")[0].data, json!([1, 2]));
    }

    #[tokio::test]
    async fn inbound_heartbeat_is_answered_but_not_forwarded() {
        let harness = Harness::new(test_config(), vec![ok("sid-1")]);
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = Arc::clone(&log);
            harness
                .client
                .on(kind, move |_: &Value| sink.lock().expect("log").push(kind));
        }
        assert!(harness.client.connect().await);

        harness.push(json!({"type": "heartbeat", "timestamp": 1}));
        harness.push(json!({"text": "after heartbeat"}));
        eventually("message callback", || {
            log.lock().expect("log").contains(&EventKind::Message)
        })
        .await;

        assert_eq!(
            *log.lock().expect("log"),
            vec![EventKind::Connect, EventKind::Message]
        );
        let replies = harness.sent_named("heartbeat");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].data["type"], json!("heartbeat"));
    }

    #[tokio::test]
    async fn periodic_heartbeat_is_emitted() {
        let config = test_config().with_heartbeat_interval(Duration::from_millis(10));
        let harness = Harness::new(config, vec![ok("sid-1")]);
        assert!(harness.client.connect().await);
        eventually("heartbeats", || harness.sent_named("heartbeat").len() >= 2).await;
    }

    #[tokio::test]
    async fn initial_failure_reports_error_without_reconnecting() {
        let harness = Harness::new(test_config(), vec![refused(), ok("never")]);
        let errors = recorder(&harness.client, EventKind::Error);

        assert!(!harness.client.connect().await);
        assert!(!harness.client.is_connected());
        assert!(harness
            .client
            .last_error()
            .is_some_and(|err| err.contains("handshake refused")));
        assert_eq!(errors.lock().expect("errors").len(), 1);
        assert_eq!(harness.client.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.connects(), 1);

        // A later explicit connect uses the next scripted result.
        assert!(harness.client.connect().await);
        assert_eq!(harness.client.connection_id().as_deref(), Some("never"));
    }

    #[tokio::test]
    async fn initial_failure_can_opt_into_reconnect() {
        let mut config = test_config();
        config.reconnect_on_initial_failure = true;
        let harness = Harness::new(config, vec![refused(), ok("sid-2")]);

        assert!(!harness.client.connect().await);
        eventually("reconnect", || harness.client.is_connected()).await;
        assert_eq!(harness.client.connection_id().as_deref(), Some("sid-2"));
    }

    #[tokio::test]
    async fn successful_reconnect_resets_attempt_counter() {
        let harness = Harness::new(
            test_config(),
            vec![ok("s1"), refused(), ok("s2"), refused(), ok("s3")],
        );
        let disconnects = recorder(&harness.client, EventKind::Disconnect);
        let errors = recorder(&harness.client, EventKind::Error);
        assert!(harness.client.connect().await);

        harness.drop_connection();
        eventually("s2", || harness.client.connection_id().as_deref() == Some("s2")).await;
        assert_eq!(
            disconnects.lock().expect("disconnects")[0],
            json!({"code": 1000, "reason": "connection closed: test drop"})
        );

        // Two more attempts are allowed only because the counter was reset.
        harness.drop_connection();
        eventually("s3", || harness.client.connection_id().as_deref() == Some("s3")).await;
        eventually("third registration", || harness.sent_named("register_sid").len() == 3).await;

        // Script exhausted: two failing attempts, then the cap is reported.
        harness.drop_connection();
        eventually("give up", || {
            harness
                .client
                .last_error()
                .is_some_and(|err| err.contains("exhausted"))
        })
        .await;
        assert_eq!(harness.connects(), 7);
        assert_eq!(harness.client.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.lock().expect("disconnects").len(), 3);
        // One refused attempt per early outage, two in the last, then the cap.
        assert_eq!(errors.lock().expect("errors").len(), 5);
    }

    #[tokio::test]
    async fn disconnect_from_callback_stops_reconnects() {
        let harness = Harness::new(test_config(), vec![ok("s1"), ok("s2")]);
        let client = harness.client.clone();
        harness.client.on(EventKind::AuthSuccess, move |_: &Value| client.disconnect());
        assert!(harness.client.connect().await);

        harness.push(json!({"type": "auth_success", "session_id": "x"}));
        eventually("disconnect", || !harness.client.is_connected()).await;
        assert_eq!(harness.client.connection_id(), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.connects(), 1);
        assert_eq!(harness.client.state(), ConnectionState::Disconnected);
        harness.client.disconnect();
    }

    #[tokio::test]
    async fn unknown_event_names_are_rejected() {
        let harness = Harness::new(test_config(), vec![]);
        assert!(harness.client.on_named("kyc_complete", |_: &Value| {}).is_ok());
        assert!(harness.client.on_named("heartbeat", |_: &Value| {}).is_err());
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = ChannelConfig::new("ftp://relay.test");
        assert!(RealtimeClient::new(config).is_err());
    }

    /// Relay stand-in that answers every `subscribe` with `auth_success`.
    struct EchoTransport {
        replies: mpsc::UnboundedSender<InboundFrame>,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
        connected: bool,
    }

    impl EchoTransport {
        fn new() -> Self {
            let (replies, inbound) = mpsc::unbounded_channel();
            Self {
                replies,
                inbound,
                connected: false,
            }
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn connect(&mut self, _config: &ChannelConfig) -> Result<String, TransportError> {
            self.connected = true;
            Ok("echo-1".to_string())
        }

        async fn send(&mut self, event: &OutboundEvent) -> Result<(), TransportError> {
            if event.event == "subscribe" {
                let reply = json!({
                    "type": "auth_success",
                    "session_id": event.data["session_id"],
                    "user_id": "U1",
                });
                let _ = self.replies.send(InboundFrame::new("message", reply));
            }
            Ok(())
        }

        async fn receive(&mut self) -> Result<InboundFrame, TransportError> {
            match self.inbound.recv().await {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.connected = false;
        }

        fn connection_id(&self) -> Option<&str> {
            self.connected.then_some("echo-1")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_relay_replies_are_not_overwritten_by_subscribe() {
        let client = RealtimeClient::with_transport(test_config(), Box::new(EchoTransport::new()))
            .expect("client");
        let authenticated = recorder(&client, EventKind::AuthSuccess);
        assert!(client.connect().await);

        let total = 500;
        for n in 0..total {
            assert!(client.subscribe(&format!("s{n}")));
        }
        eventually("all replies dispatched", || {
            authenticated.lock().expect("seen").len() == total
        })
        .await;

        let sessions = client.active_sessions();
        assert_eq!(sessions.len(), total);
        for (id, record) in &sessions {
            assert_eq!(record.status, SessionStatus::Authenticated, "session {id}");
            assert_eq!(record.user_id, Some(json!("U1")), "session {id}");
        }

        // Re-subscribing an authenticated session keeps its state.
        assert!(client.subscribe("s0"));
        assert_eq!(
            client.active_sessions()["s0"].status,
            SessionStatus::Authenticated
        );
        client.disconnect();
    }
}
