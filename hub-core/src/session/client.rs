//! Client session: handshake, heartbeat-driven reconnect and the roster mirror.
//!
//! ```text
//!  start ──► connect ──► Connect sent ──► ConnectResponse
//!               ▲                              │
//!               └── heartbeat send fails ◄─────┘
//! ```
//!
//! The heartbeat timer is the only retry mechanism: it is paused while a
//! connect is in flight and re-armed when the attempt succeeds or fails.
//! A stream error leaves it armed, so the next tick fails to send and
//! starts a new connect.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::error::HubError;
use crate::message::{
    Acknowledgement, ClientType, Connect, ConnectResponse, Event, ForwardingPacket, Frame, PeerId,
    User,
};
use crate::network::{
    AwaitResponse, Connection, ConnectionEvent, ConnectionInfo, EventBus, RequestOutcome,
    Subscription, DEFAULT_REQUEST_TIMEOUT,
};
use crate::packet::{Packet, Payload};
use crate::state::{SessionPhase, State};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub name: String,
    pub client_type: ClientType,
    pub user_id: String,
    pub password: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub version_code: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            client_type: ClientType::User,
            user_id: "0".to_string(),
            password: String::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            version_code: crate::VERSION_CODE,
        }
    }
}

impl ClientOptions {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn observer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_type: ClientType::TemporaryConnection,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectedToServer(ConnectResponse),
    /// `None` when the TCP connect itself failed.
    FailedToConnect(Option<ConnectResponse>),
    ServerDisconnected,
    UserAdded(User),
    UserUpdated(User),
    UserLeft(User),
    AckReceived {
        ack: Acknowledgement,
        from: PeerId,
    },
    FrameReceived(Frame),
    /// Every inbound packet, TCP or UDP, before it is handled.
    PacketReceived(Packet),
}

struct Shared {
    connection: Connection,
    options: ClientOptions,
    phase: Mutex<SessionPhase>,
    state: Mutex<State>,
    self_user: Mutex<Option<User>>,
    last_frame: AtomicI64,
    heartbeat: watch::Sender<bool>,
    stopped: AtomicBool,
    closed: CancellationToken,
    events: EventBus<ClientEvent>,
    span: Span,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct HubClient {
    shared: Arc<Shared>,
}

impl HubClient {
    /// Create the session and its background tasks without connecting.
    /// Subscribe before calling [`HubClient::start`] to see every event.
    pub fn new(info: ConnectionInfo, options: ClientOptions, span: Span) -> Self {
        let connection = Connection::new(info, span.clone());
        let inbound = connection.subscribe();
        let (heartbeat, armed) = watch::channel(false);

        let client = Self {
            shared: Arc::new(Shared {
                connection,
                options,
                phase: Mutex::new(SessionPhase::default()),
                state: Mutex::new(State::default()),
                self_user: Mutex::new(None),
                last_frame: AtomicI64::new(i64::MIN),
                heartbeat,
                stopped: AtomicBool::new(false),
                closed: CancellationToken::new(),
                events: EventBus::new(),
                span: span.clone(),
            }),
        };

        tokio::spawn(client.clone().dispatch(inbound).instrument(span.clone()));
        tokio::spawn(client.clone().heartbeat_loop(armed).instrument(span));
        client
    }

    /// Connect for the first time. On failure the heartbeat keeps retrying.
    pub async fn start(&self) -> Result<(), HubError> {
        self.connect_to_server().await
    }

    pub fn subscribe(&self) -> Subscription<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        locked(&self.shared.phase).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.phase().is_connected()
    }

    /// Snapshot of the local roster mirror.
    pub fn state(&self) -> State {
        locked(&self.shared.state).clone()
    }

    /// This client's own roster entry, once the handshake has succeeded.
    pub fn self_user(&self) -> Option<User> {
        locked(&self.shared.self_user).clone()
    }

    fn self_id(&self) -> PeerId {
        locked(&self.shared.self_user)
            .as_ref()
            .map(|user| user.id)
            .unwrap_or(PeerId::NIL)
    }

    fn arm_heartbeat(&self, armed: bool) {
        let armed = armed && !self.shared.stopped.load(Ordering::Acquire);
        self.shared.heartbeat.send_replace(armed);
    }

    // ── Connect ──────────────────────────────────────────────────

    async fn connect_to_server(&self) -> Result<(), HubError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(HubError::NotConnected);
        }
        if locked(&self.shared.phase).begin_connect().is_err() {
            debug!("connect already in flight");
            return Ok(());
        }

        self.arm_heartbeat(false);
        *locked(&self.shared.state) = State::default();
        self.shared.last_frame.store(i64::MIN, Ordering::Release);

        // Outcome is handled by `dispatch` through the connection's events.
        self.shared.connection.start().await
    }

    async fn on_connected(&self) {
        if self.shared.stopped.load(Ordering::Acquire) {
            self.shared.connection.shutdown().await;
            return;
        }
        {
            let mut phase = locked(&self.shared.phase);
            if phase.complete_connect().is_err() {
                debug!(phase = %phase, "connected outside of a connect attempt");
                *phase = SessionPhase::Connected {
                    since: Instant::now(),
                };
            }
        }
        self.arm_heartbeat(true);

        let options = &self.shared.options;
        let connect = Connect {
            client_type: options.client_type,
            name: options.name.clone(),
            password: options.password.clone(),
            user_id: options.user_id.clone(),
            client_version: options.version_code,
        };
        if let Err(e) = self.send(Packet::new(connect)).await {
            warn!(error = %e, "failed to send handshake");
        }
    }

    fn on_failed_to_connect(&self, reason: &str) {
        debug!(%reason, "connect failed, retrying on next heartbeat");
        let _ = locked(&self.shared.phase).fail_connect();
        self.arm_heartbeat(true);
        self.shared.events.publish(ClientEvent::FailedToConnect(None));
    }

    fn on_disconnected(&self) {
        {
            let mut phase = locked(&self.shared.phase);
            if phase.is_connected() {
                phase.force_disconnect();
            }
        }
        info!("server disconnected");
        self.shared.events.publish(ClientEvent::ServerDisconnected);
    }

    // ── Heartbeat ────────────────────────────────────────────────

    async fn heartbeat_loop(self, mut armed: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.shared.options.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !*armed.borrow_and_update() {
                tokio::select! {
                    _ = self.shared.closed.cancelled() => break,
                    changed = armed.changed() => if changed.is_err() { break },
                }
                interval.reset();
                continue;
            }

            tokio::select! {
                _ = self.shared.closed.cancelled() => break,
                changed = armed.changed() => {
                    if changed.is_err() { break }
                    continue;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.send(Packet::heartbeat()).await {
                debug!(error = %e, "heartbeat failed, reconnecting");
                if let Err(e) = self.connect_to_server().await {
                    debug!(error = %e, "reconnect failed");
                }
            }
        }
        debug!("heartbeat stopped");
    }

    // ── Dispatch ─────────────────────────────────────────────────

    async fn dispatch(self, mut inbound: Subscription<ConnectionEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                event = inbound.recv() => event,
                _ = self.shared.closed.cancelled() => None,
            };
            let Some(event) = event else { break };

            match event {
                ConnectionEvent::Connected => self.on_connected().await,
                ConnectionEvent::FailedToConnect(reason) => self.on_failed_to_connect(&reason),
                ConnectionEvent::Disconnected(_) => self.on_disconnected(),
                ConnectionEvent::Packet(packet) => self.handle_packet(packet),
                ConnectionEvent::UdpPacket(packet) => self.handle_packet(packet),
            }
        }
        debug!("client dispatch stopped");
    }

    fn handle_packet(&self, packet: Packet) {
        debug!(packet = %packet.summary(), "received");
        self.shared
            .events
            .publish(ClientEvent::PacketReceived(packet.clone()));

        let from = packet.from;
        match packet.payload {
            Payload::ConnectResponse(response) => self.on_connect_response(response),
            Payload::Event(event) => self.apply_event(event),
            Payload::Acknowledgement(ack) => {
                self.shared
                    .events
                    .publish(ClientEvent::AckReceived { ack, from });
            }
            Payload::Frame(frame) => {
                let previous = self
                    .shared
                    .last_frame
                    .fetch_max(frame.timestamp, Ordering::AcqRel);
                if frame.timestamp < previous {
                    trace!(timestamp = frame.timestamp, previous, "dropping stale frame");
                } else {
                    self.shared.events.publish(ClientEvent::FrameReceived(frame));
                }
            }
            Payload::Connect(_) | Payload::Command(_) | Payload::Forwarding(_) => {}
        }
    }

    fn on_connect_response(&self, response: ConnectResponse) {
        if response.response.is_success() {
            *locked(&self.shared.self_user) = response.self_user.clone();
            *locked(&self.shared.state) = response.state.clone().unwrap_or_default();
            info!(
                message = %response.response.message,
                user = ?response.self_user.as_ref().map(|u| u.id),
                "joined server"
            );
            self.shared
                .events
                .publish(ClientEvent::ConnectedToServer(response));
        } else {
            warn!(message = %response.response.message, "server rejected handshake");
            self.shared
                .events
                .publish(ClientEvent::FailedToConnect(Some(response)));
        }
    }

    fn apply_event(&self, event: Event) {
        locked(&self.shared.state).apply(&event);
        match event {
            Event::UserAdded(user) => self.shared.events.publish(ClientEvent::UserAdded(user)),
            Event::UserUpdated(user) => {
                {
                    let mut self_user = locked(&self.shared.self_user);
                    if self_user.as_ref().is_some_and(|me| me.id == user.id) {
                        *self_user = Some(user.clone());
                    }
                }
                self.shared.events.publish(ClientEvent::UserUpdated(user));
            }
            Event::UserLeft(user) => self.shared.events.publish(ClientEvent::UserLeft(user)),
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Send to the server, stamped with this client's id.
    pub async fn send(&self, packet: Packet) -> Result<(), HubError> {
        let packet = packet.with_from(self.self_id());
        trace!(packet = %packet.summary(), "sending");
        self.shared.connection.send(&packet).await
    }

    /// Have the server relay `packet` to `peers`.
    pub async fn send_to(&self, peers: &[PeerId], packet: Packet) -> Result<(), HubError> {
        let inner = packet.with_from(self.self_id());
        let forwarding = ForwardingPacket::new(&inner, peers.to_vec())?;
        self.send(Packet::new(forwarding)).await
    }

    pub async fn send_udp(&self, packet: Packet) -> Result<(), HubError> {
        let packet = packet.with_from(self.self_id());
        self.shared.connection.send_udp(&packet).await
    }

    /// Send `packet` and wait for a reply. `request` defaults to the
    /// session's configured timeout unless it sets its own.
    pub async fn send_and_await_response(
        &self,
        packet: Packet,
        request: AwaitResponse,
    ) -> Result<RequestOutcome, HubError> {
        let packet = packet.with_from(self.self_id());
        self.shared
            .connection
            .send_and_await_response(&packet, request)
            .await
    }

    /// An [`AwaitResponse`] using this session's request timeout.
    pub fn request(&self, predicate: impl FnMut(&Packet) -> bool + Send + 'static) -> AwaitResponse {
        AwaitResponse::new(predicate).with_timeout(self.shared.options.request_timeout)
    }

    // ── Roster requests ──────────────────────────────────────────

    /// Ask the server to add `user`. The local mirror changes only when
    /// the resulting event comes back.
    pub async fn add_user(&self, user: User) -> Result<(), HubError> {
        self.send(Packet::new(Event::UserAdded(user))).await
    }

    pub async fn update_user(&self, user: User) -> Result<(), HubError> {
        self.send(Packet::new(Event::UserUpdated(user))).await
    }

    pub async fn remove_user(&self, user: User) -> Result<(), HubError> {
        self.send(Packet::new(Event::UserLeft(user))).await
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Stop heartbeats for good and close the connection. A connect still
    /// in flight cannot re-arm the heartbeat afterwards.
    pub async fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.heartbeat.send_replace(false);
        self.shared.connection.shutdown().await;
        self.shared.closed.cancel();
        self.shared.span.in_scope(|| info!("client shut down"));
    }
}
