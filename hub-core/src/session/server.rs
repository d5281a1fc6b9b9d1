//! Server session: handshake, roster authority and forwarding.
//!
//! A router task hands each peer's packets to a worker task of its own, so
//! packets from one peer are handled in arrival order while unrelated peers
//! never wait on each other. Roster changes hold the roster lock until their
//! event is queued for every peer, so all peers see changes in one order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn, Instrument, Span};

use crate::error::HubError;
use crate::message::{
    Acknowledgement, ClientType, Command, CommandType, Connect, ConnectResponse, Event,
    ForwardingPacket, PeerId, Response, User,
};
use crate::network::{
    AwaitResponse, EventBus, Listener, ListenerConfig, ListenerEvent, RequestOutcome,
    Subscription,
};
use crate::packet::{Packet, Payload};
use crate::state::{ServerSettings, State};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listener: ListenerConfig,
    pub settings: ServerSettings,
    /// Clients must send this exact value in `Connect.client_version`.
    pub version_code: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            settings: ServerSettings::default(),
            version_code: crate::VERSION_CODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    UserConnected(User),
    UserDisconnected(User),
    UserUpdated(User),
    AckReceived {
        peer: PeerId,
        ack: Acknowledgement,
    },
    UdpPacket {
        from: SocketAddr,
        packet: Packet,
    },
    /// Every packet received over TCP, before it is handled.
    PacketReceived {
        peer: PeerId,
        packet: Packet,
    },
}

struct Shared {
    listener: Listener,
    state: Mutex<State>,
    events: EventBus<ServerEvent>,
    version_code: u32,
    closed: CancellationToken,
    span: Span,
}

#[derive(Clone)]
pub struct HubServer {
    shared: Arc<Shared>,
}

impl HubServer {
    /// Bind the listener and start serving.
    pub async fn start(options: ServerOptions, span: Span) -> Result<Self, HubError> {
        let listener = Listener::bind(&options.listener, span.clone()).await?;
        Ok(Self::with_listener(listener, options, span))
    }

    /// Serve on an existing listener.
    pub fn with_listener(listener: Listener, options: ServerOptions, span: Span) -> Self {
        let inbound = listener.subscribe();
        let server = Self {
            shared: Arc::new(Shared {
                listener,
                state: Mutex::new(State::new(options.settings)),
                events: EventBus::new(),
                version_code: options.version_code,
                closed: CancellationToken::new(),
                span: span.clone(),
            }),
        };
        tokio::spawn(server.clone().dispatch(inbound).instrument(span));
        server
    }

    pub fn subscribe(&self) -> Subscription<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn listener(&self) -> &Listener {
        &self.shared.listener
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.local_addr()
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.shared.listener.udp_local_addr()
    }

    /// Snapshot of the roster.
    pub async fn state(&self) -> State {
        self.shared.state.lock().await.clone()
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Route listener events to per-peer workers. Never awaits anything
    /// but the next event.
    async fn dispatch(self, mut inbound: Subscription<ListenerEvent>) {
        let mut workers: HashMap<PeerId, mpsc::UnboundedSender<Packet>> = HashMap::new();
        loop {
            let event = tokio::select! {
                biased;
                event = inbound.recv() => event,
                _ = self.shared.closed.cancelled() => None,
            };
            let Some(event) = event else { break };

            match event {
                ListenerEvent::Connected { peer, addr } => {
                    debug!(%peer, ?addr, "awaiting handshake");
                    workers.entry(peer).or_insert_with(|| self.spawn_worker(peer));
                }
                ListenerEvent::Packet { peer, packet } => {
                    let worker = workers.entry(peer).or_insert_with(|| self.spawn_worker(peer));
                    if worker.send(packet).is_err() {
                        warn!(%peer, "peer worker stopped, dropping packet");
                    }
                }
                // Dropping the sender lets the worker finish its backlog
                // before it removes the user.
                ListenerEvent::Disconnected { peer, .. } => {
                    if workers.remove(&peer).is_none() {
                        drop(self.spawn_worker(peer));
                    }
                }
                ListenerEvent::Udp { from, packet } => {
                    self.shared
                        .events
                        .publish(ServerEvent::UdpPacket { from, packet });
                }
            }
        }
        debug!("server dispatch stopped");
    }

    /// Handle one peer's packets in order, then its departure.
    fn spawn_worker(&self, peer: PeerId) -> mpsc::UnboundedSender<Packet> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = self.clone();
        let span = debug_span!(parent: &self.shared.span, "peer", %peer);
        tokio::spawn(
            async move {
                while let Some(packet) = rx.recv().await {
                    server.handle_packet(peer, packet).await;
                }
                if server.remove_user(&peer).await.is_none() {
                    debug!("non-roster peer left");
                }
            }
            .instrument(span),
        );
        tx
    }

    async fn handle_packet(&self, peer: PeerId, packet: Packet) {
        debug!(%peer, packet = %packet.summary(), "received");
        self.shared.events.publish(ServerEvent::PacketReceived {
            peer,
            packet: packet.clone(),
        });

        match packet.payload {
            Payload::Connect(connect) => self.handshake(peer, connect).await,
            Payload::Event(event) => match event {
                Event::UserAdded(user) => self.add_user(user).await,
                Event::UserUpdated(user) => self.update_user(user).await,
                Event::UserLeft(user) => {
                    self.remove_user(&user.id).await;
                }
            },
            Payload::Acknowledgement(ack) => {
                self.shared
                    .events
                    .publish(ServerEvent::AckReceived { peer, ack });
            }
            Payload::Forwarding(forwarding) => self.relay(peer, forwarding).await,
            Payload::Command(Command {
                command_type: CommandType::Heartbeat,
            }) => trace!(%peer, "heartbeat"),
            Payload::Command(_) | Payload::Frame(_) | Payload::ConnectResponse(_) => {}
        }
    }

    async fn handshake(&self, peer: PeerId, connect: Connect) {
        let version_code = self.shared.version_code;

        if connect.client_version != version_code {
            let mismatch = HubError::VersionMismatch {
                expected: version_code,
                actual: connect.client_version,
            };
            info!(%peer, error = %mismatch, "rejecting client");
            let message = format!(
                "Version mismatch, this server is on version {} ({version_code})",
                crate::VERSION
            );
            self.reply(peer, self.failure(message)).await;
            return;
        }

        // Held until the reply is queued, so the snapshot in the reply and
        // the events queued before and after it line up.
        let mut state = self.shared.state.lock().await;
        if !state.server_settings.accepts_password(&connect.password) {
            drop(state);
            info!(%peer, name = %connect.name, "rejecting client with wrong password");
            self.reply(peer, self.failure("Incorrect password")).await;
            return;
        }

        let self_user = match connect.client_type {
            ClientType::User => {
                let user = User::new(peer, connect.name);
                self.commit_add(&mut state, user.clone()).await;
                Some(user)
            }
            ClientType::TemporaryConnection => None,
        };

        let message = match connect.client_type {
            ClientType::User => "Connected to server!",
            ClientType::TemporaryConnection => "Connected to server (observer)!",
        };
        let response = ConnectResponse {
            response: Response::success(message),
            self_user,
            state: Some(state.redacted()),
            server_version: version_code,
        };
        self.reply(peer, response).await;
    }

    fn failure(&self, message: impl Into<String>) -> ConnectResponse {
        ConnectResponse {
            response: Response::fail(message),
            self_user: None,
            state: None,
            server_version: self.shared.version_code,
        }
    }

    async fn reply(&self, peer: PeerId, response: ConnectResponse) {
        if let Err(e) = self.send(&peer, Packet::new(response)).await {
            warn!(%peer, error = %e, "failed to send connect response");
        }
    }

    async fn relay(&self, from: PeerId, forwarding: ForwardingPacket) {
        let inner = match forwarding.packet() {
            Ok(inner) => inner.with_from(from),
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping undecodable forwarded packet");
                return;
            }
        };
        match self
            .shared
            .listener
            .send_many(&forwarding.destinations, &inner)
            .await
        {
            Ok(delivered) => trace!(
                peer = %from,
                delivered,
                requested = forwarding.destinations.len(),
                "relayed"
            ),
            Err(e) => warn!(peer = %from, error = %e, "relay failed"),
        }
    }

    // ── Roster ───────────────────────────────────────────────────

    /// Add `user`, tell every peer, then notify local subscribers.
    pub async fn add_user(&self, user: User) {
        let mut state = self.shared.state.lock().await;
        self.commit_add(&mut state, user).await;
    }

    /// Replace the entry with `user.id`, inserting it if absent.
    pub async fn update_user(&self, user: User) {
        let mut state = self.shared.state.lock().await;
        state.update_user(user.clone());
        debug!(user = %user.id, name = %user.name, "user updated");
        self.broadcast_quiet(Event::UserUpdated(user.clone())).await;
        self.shared.events.publish(ServerEvent::UserUpdated(user));
    }

    /// Remove `id` from the roster. Returns the removed user, or `None`
    /// (with nothing broadcast) if there was no such entry.
    pub async fn remove_user(&self, id: &PeerId) -> Option<User> {
        let mut state = self.shared.state.lock().await;
        let removed = state.remove_user(id)?;
        info!(user = %removed.id, name = %removed.name, "user left");
        self.broadcast_quiet(Event::UserLeft(removed.clone())).await;
        self.shared
            .events
            .publish(ServerEvent::UserDisconnected(removed.clone()));
        Some(removed)
    }

    async fn commit_add(&self, state: &mut MutexGuard<'_, State>, user: User) {
        state.add_user(user.clone());
        info!(user = %user.id, name = %user.name, "user joined");
        self.broadcast_quiet(Event::UserAdded(user.clone())).await;
        self.shared.events.publish(ServerEvent::UserConnected(user));
    }

    async fn broadcast_quiet(&self, event: Event) {
        if let Err(e) = self.broadcast(Packet::new(event)).await {
            warn!(error = %e, "roster broadcast failed");
        }
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Server-originated packets always carry the host id.
    fn stamp(packet: Packet) -> Packet {
        packet.with_from(User::host().id)
    }

    pub async fn send(&self, peer: &PeerId, packet: Packet) -> Result<(), HubError> {
        self.shared.listener.send(peer, &Self::stamp(packet)).await
    }

    /// Send to each listed peer. Returns the number of successful writes.
    pub async fn send_to(&self, peers: &[PeerId], packet: Packet) -> Result<usize, HubError> {
        self.shared.listener.send_many(peers, &Self::stamp(packet)).await
    }

    pub async fn broadcast(&self, packet: Packet) -> Result<usize, HubError> {
        self.shared.listener.broadcast(&Self::stamp(packet)).await
    }

    pub async fn send_udp(&self, packet: Packet, to: SocketAddr) -> Result<(), HubError> {
        self.shared.listener.send_udp(&Self::stamp(packet), to).await
    }

    pub async fn send_and_await_response(
        &self,
        peer: &PeerId,
        packet: Packet,
        request: AwaitResponse,
    ) -> Result<RequestOutcome, HubError> {
        self.shared
            .listener
            .send_and_await_response(peer, &Self::stamp(packet), request)
            .await
    }

    /// Close every socket. Each peer's worker still removes its user
    /// through the normal disconnect path.
    pub async fn shutdown(&self) {
        self.shared.listener.shutdown().await;
        self.shared.closed.cancel();
        self.shared.span.in_scope(|| info!("server shut down"));
    }
}
