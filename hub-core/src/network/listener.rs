//! Server-side transport.
//!
//! One accept loop per address family, one UDP receive loop, and one read
//! loop plus one write loop per accepted stream, all running as independent
//! tasks. The peer registry sits behind its own lock. Sends only queue
//! envelopes, so no caller ever waits on a slow peer's socket.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::codec;
use crate::error::HubError;
use crate::header::HEADER_SIZE;
use crate::message::PeerId;
use crate::network::bus::{EventBus, Subscription};
use crate::network::peer::{self, DisconnectReason, Peer};
use crate::network::request::{AwaitResponse, PendingRequest, RequestOutcome};
use crate::packet::{Packet, MAX_DATAGRAM_SIZE};

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl ListenerConfig {
    /// TCP on `port`, UDP on `port + 1`. Port 0 picks ephemeral ports for both.
    pub fn new(port: u16) -> Self {
        let udp_port = if port == 0 { 0 } else { port.saturating_add(1) };
        Self {
            tcp_port: port,
            udp_port,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Connected {
        peer: PeerId,
        addr: Option<SocketAddr>,
    },
    Disconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    Packet {
        peer: PeerId,
        packet: Packet,
    },
    Udp {
        from: SocketAddr,
        packet: Packet,
    },
}

struct Shared {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    events: EventBus<ListenerEvent>,
    udp: Option<Arc<UdpSocket>>,
    tcp_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    span: Span,
}

#[derive(Clone)]
pub struct Listener {
    shared: Arc<Shared>,
}

impl Listener {
    /// Bind TCP on IPv4 and IPv6 plus the UDP socket, and start serving.
    ///
    /// The IPv6 bind is best effort: on hosts where `[::]` is dual-stack it
    /// collides with the IPv4 socket and IPv4-mapped clients are served by
    /// the IPv4 listener anyway.
    pub async fn bind(config: &ListenerConfig, span: Span) -> Result<Self, HubError> {
        let ipv4 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.tcp_port)).await?;
        let tcp_addr = ipv4.local_addr()?;

        let ipv6 = match TcpListener::bind((Ipv6Addr::UNSPECIFIED, tcp_addr.port())).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                span.in_scope(|| debug!(error = %e, "IPv6 listener unavailable, serving IPv4 only"));
                None
            }
        };

        let udp = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.udp_port)).await?);

        let listener = Self::build(Some(tcp_addr), Some(Arc::clone(&udp)), span);
        listener.spawn_accept_loop(ipv4);
        if let Some(ipv6) = ipv6 {
            listener.spawn_accept_loop(ipv6);
        }
        listener.spawn_udp_loop(udp);

        let udp_addr = listener.udp_local_addr();
        listener.shared.span.in_scope(|| {
            info!(tcp = %tcp_addr, udp = ?udp_addr, "listening");
        });
        Ok(listener)
    }

    /// A listener with no sockets of its own. Streams are added through
    /// [`Listener::attach`].
    pub fn detached(span: Span) -> Self {
        Self::build(None, None, span)
    }

    fn build(tcp_addr: Option<SocketAddr>, udp: Option<Arc<UdpSocket>>, span: Span) -> Self {
        Self {
            shared: Arc::new(Shared {
                peers: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                udp,
                tcp_addr,
                shutdown: CancellationToken::new(),
                span,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<ListenerEvent> {
        self.shared.events.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.tcp_addr
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.shared.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.shared.peers.lock().await.keys().copied().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.shared.peers.lock().await.contains_key(id)
    }

    // ── Loops ────────────────────────────────────────────────────

    fn spawn_accept_loop(&self, tcp: TcpListener) {
        let this = self.clone();
        let span = self.shared.span.clone();
        tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = this.shared.shutdown.cancelled() => break,
                        accepted = tcp.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                trace!(%addr, error = %e, "set_nodelay failed");
                            }
                            let (reader, writer) = stream.into_split();
                            this.attach(reader, writer, Some(addr)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                debug!("accept loop stopped");
            }
            .instrument(span),
        );
    }

    fn spawn_udp_loop(&self, udp: Arc<UdpSocket>) {
        let this = self.clone();
        let span = self.shared.span.clone();
        tokio::spawn(
            async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let received = tokio::select! {
                        _ = this.shared.shutdown.cancelled() => break,
                        received = udp.recv_from(&mut buf) => received,
                    };
                    match received {
                        Ok((len, from)) if len < HEADER_SIZE => {
                            trace!(%from, len, "ignoring runt datagram");
                        }
                        Ok((len, from)) => match Packet::from_datagram(&buf[..len]) {
                            Ok(packet) => {
                                trace!(%from, packet = %packet.summary(), "received datagram");
                                this.shared.events.publish(ListenerEvent::Udp { from, packet });
                            }
                            Err(e) => warn!(%from, error = %e, "discarding undecodable datagram"),
                        },
                        // Some platforms surface ICMP errors from earlier sends here.
                        Err(e) => debug!(error = %e, "udp receive failed"),
                    }
                }
                debug!("udp loop stopped");
            }
            .instrument(span),
        );
    }

    /// Register a stream as a new peer and start its read loop.
    pub async fn attach<R, W>(&self, reader: R, writer: W, addr: Option<SocketAddr>) -> PeerId
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = PeerId::new();
        let (peer, write_loop) = Peer::new(
            id,
            addr,
            Box::new(writer),
            self.shared.shutdown.child_token(),
        );
        let peer = Arc::new(peer);

        self.shared.peers.lock().await.insert(id, Arc::clone(&peer));
        self.shared.span.in_scope(|| info!(peer = %id, ?addr, "peer connected"));
        self.shared
            .events
            .publish(ListenerEvent::Connected { peer: id, addr });

        let this = self.clone();
        let write_peer = Arc::clone(&peer);
        tokio::spawn(
            async move {
                if let Err(e) = write_loop.run().await {
                    warn!(peer = %id, error = %e, "write failed");
                    this.disconnect(&write_peer, DisconnectReason::Transport(e.to_string()))
                        .await;
                }
            }
            .instrument(self.shared.span.clone()),
        );

        let this = self.clone();
        let span = self.shared.span.clone();
        tokio::spawn(
            async move {
                let events = this.shared.events.clone();
                let reason = peer::read_loop(reader, peer.cancel_token(), |packet| {
                    events.publish(ListenerEvent::Packet { peer: id, packet });
                })
                .await;
                this.disconnect(&peer, reason).await;
            }
            .instrument(span),
        );
        id
    }

    /// The single cleanup path for a peer. Runs at most once per peer.
    async fn disconnect(&self, peer: &Arc<Peer>, reason: DisconnectReason) {
        if !peer.mark_disconnected() {
            return;
        }
        self.shared.peers.lock().await.remove(&peer.id());
        peer.close();
        self.shared
            .span
            .in_scope(|| info!(peer = %peer.id(), %reason, "peer disconnected"));
        self.shared.events.publish(ListenerEvent::Disconnected {
            peer: peer.id(),
            reason,
        });
    }

    /// Close one peer's stream.
    pub async fn kick(&self, id: &PeerId) -> Result<(), HubError> {
        let peer = self.peer(id).await.ok_or(HubError::PeerNotFound(*id))?;
        self.disconnect(&peer, DisconnectReason::Shutdown).await;
        Ok(())
    }

    async fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.shared.peers.lock().await.get(id).cloned()
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Queue `packet` for one peer. A peer whose queue is full is
    /// disconnected.
    pub async fn send(&self, id: &PeerId, packet: &Packet) -> Result<(), HubError> {
        let peer = self.peer(id).await.ok_or(HubError::PeerNotFound(*id))?;
        trace!(peer = %id, packet = %packet.summary(), "sending");
        if let Err(e) = peer.try_send_envelope(codec::encode_envelope(packet)?) {
            self.disconnect(&peer, DisconnectReason::Transport(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Queue for every listed peer that is still registered. Returns how
    /// many peers accepted it; a peer that cannot is disconnected alone.
    pub async fn send_many(&self, ids: &[PeerId], packet: &Packet) -> Result<usize, HubError> {
        let targets: Vec<Arc<Peer>> = {
            let peers = self.shared.peers.lock().await;
            ids.iter()
                .filter_map(|id| {
                    let peer = peers.get(id).cloned();
                    if peer.is_none() {
                        debug!(peer = %id, "dropping send to unknown peer");
                    }
                    peer
                })
                .collect()
        };
        self.deliver(targets, packet).await
    }

    /// Send to every registered peer.
    pub async fn broadcast(&self, packet: &Packet) -> Result<usize, HubError> {
        let targets: Vec<Arc<Peer>> = self.shared.peers.lock().await.values().cloned().collect();
        self.deliver(targets, packet).await
    }

    async fn deliver(&self, targets: Vec<Arc<Peer>>, packet: &Packet) -> Result<usize, HubError> {
        let envelope: Bytes = codec::encode_envelope(packet)?;
        trace!(peers = targets.len(), packet = %packet.summary(), "sending to many");

        let mut delivered = 0;
        for peer in &targets {
            match peer.try_send_envelope(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer = %peer.id(), error = %e, "send failed");
                    self.disconnect(peer, DisconnectReason::Transport(e.to_string()))
                        .await;
                }
            }
        }
        Ok(delivered)
    }

    pub async fn send_udp(&self, packet: &Packet, to: SocketAddr) -> Result<(), HubError> {
        let udp = self.shared.udp.as_ref().ok_or(HubError::NotConnected)?;
        let datagram = packet.to_bytes()?;
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(HubError::PayloadTooLarge {
                size: datagram.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        udp.send_to(&datagram, to).await?;
        Ok(())
    }

    /// Send `packet` to `id` and wait for a reply from that same peer.
    pub async fn send_and_await_response(
        &self,
        id: &PeerId,
        packet: &Packet,
        request: AwaitResponse,
    ) -> Result<RequestOutcome, HubError> {
        let target = *id;
        let replies = self
            .subscribe()
            .into_stream()
            .filter_map(move |event| {
                futures::future::ready(match event {
                    ListenerEvent::Packet { peer, packet } if peer == target => Some(packet),
                    _ => None,
                })
            });

        let pending = PendingRequest::register(replies, request, self.shared.span.clone());
        if let Err(e) = self.send(id, packet).await {
            pending.cancel();
            return Err(e);
        }
        pending.outcome().await
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Stop accepting, stop the UDP loop and close every peer. Each peer
    /// goes through the normal disconnect path.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let peers: Vec<Arc<Peer>> = self.shared.peers.lock().await.values().cloned().collect();
        for peer in &peers {
            self.disconnect(peer, DisconnectReason::Shutdown).await;
        }
        self.shared.span.in_scope(|| info!("listener shut down"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::message::{Command, CommandType};

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn udp_port_follows_tcp_port() {
        assert_eq!(ListenerConfig::new(10356).udp_port, 10357);
        assert_eq!(ListenerConfig::new(0).udp_port, 0);
    }

    #[tokio::test]
    async fn attached_peer_packets_are_published() {
        let listener = Listener::detached(Span::none());
        let mut events = listener.subscribe();

        let (mut remote, local) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let id = listener.attach(reader, writer, None).await;

        assert_eq!(
            timeout(WAIT, events.recv()).await.unwrap(),
            Some(ListenerEvent::Connected { peer: id, addr: None })
        );

        let packet = Packet::new(Command {
            command_type: CommandType::Custom("hello".into()),
        });
        tokio::io::AsyncWriteExt::write_all(&mut remote, &packet.to_bytes().unwrap())
            .await
            .unwrap();

        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ListenerEvent::Packet { peer, packet: got }) => {
                assert_eq!(peer, id);
                assert_eq!(got, packet);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_close_disconnects_once() {
        let listener = Listener::detached(Span::none());
        let mut events = listener.subscribe();

        let (remote, local) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let id = listener.attach(reader, writer, None).await;
        let _ = events.recv().await;

        drop(remote);
        assert_eq!(
            timeout(WAIT, events.recv()).await.unwrap(),
            Some(ListenerEvent::Disconnected {
                peer: id,
                reason: DisconnectReason::Eof
            })
        );
        assert_eq!(listener.peer_count().await, 0);

        listener.shutdown().await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let listener = Listener::detached(Span::none());
        let missing = PeerId::new();
        assert!(matches!(
            listener.send(&missing, &Packet::heartbeat()).await,
            Err(HubError::PeerNotFound(id)) if id == missing
        ));
        assert_eq!(
            listener.send_many(&[missing], &Packet::heartbeat()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn stalled_peer_is_dropped_without_blocking_broadcast() {
        let listener = Listener::detached(Span::none());
        let mut events = listener.subscribe();

        // Nobody reads the far end of either pipe; only the small one fills.
        let (_stalled_remote, stalled_local) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(stalled_local);
        let stalled = listener.attach(reader, writer, None).await;

        let (_healthy_remote, healthy_local) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(healthy_local);
        let healthy = listener.attach(reader, writer, None).await;

        let packet = Packet::new(Command {
            command_type: CommandType::Custom("x".repeat(128)),
        });
        timeout(WAIT, async {
            for _ in 0..peer::OUTBOUND_QUEUE_CAPACITY + 8 {
                listener.broadcast(&packet).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("broadcast waited on a stalled peer");

        let reason = timeout(WAIT, async {
            loop {
                if let Some(ListenerEvent::Disconnected { peer, reason }) = events.recv().await {
                    assert_eq!(peer, stalled);
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(reason, DisconnectReason::Transport(_)));
        assert!(!listener.contains(&stalled).await);
        assert!(listener.contains(&healthy).await);
    }
}
