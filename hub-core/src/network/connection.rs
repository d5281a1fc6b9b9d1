//! Client-side transport: one TCP stream plus a connected UDP socket.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::error::HubError;
use crate::header::HEADER_SIZE;
use crate::message::PeerId;
use crate::network::bus::{EventBus, Subscription};
use crate::network::peer::{self, DisconnectReason, Peer};
use crate::network::request::{AwaitResponse, PendingRequest, RequestOutcome};
use crate::packet::{Packet, MAX_DATAGRAM_SIZE};

/// Upper bound on one TCP connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to connect. UDP goes to `udp_port`, normally `port + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub udp_port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            udp_port: port.saturating_add(1),
        }
    }

    pub fn with_udp_port(mut self, udp_port: u16) -> Self {
        self.udp_port = udp_port;
        self
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    FailedToConnect(String),
    Disconnected(DisconnectReason),
    Packet(Packet),
    UdpPacket(Packet),
}

/// The sockets of one successful connect.
struct Link {
    peer: Arc<Peer>,
    udp: Arc<UdpSocket>,
}

struct Inner {
    info: ConnectionInfo,
    events: EventBus<ConnectionEvent>,
    link: Mutex<Option<Link>>,
    span: Span,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(info: ConnectionInfo, span: Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                info,
                events: EventBus::new(),
                link: Mutex::new(None),
                span,
            }),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.link.lock().await.is_some()
    }

    /// Connect, replacing any existing link without reporting it as a
    /// disconnect. Publishes `Connected` or `FailedToConnect`.
    pub async fn start(&self) -> Result<(), HubError> {
        let old = self.inner.link.lock().await.take();
        if let Some(old) = old {
            if old.peer.mark_disconnected() {
                old.peer.close();
            }
        }

        let info = &self.inner.info;
        self.inner.span.in_scope(|| debug!(%info, "connecting"));
        match self.open().await {
            Ok(()) => {
                self.inner.span.in_scope(|| info!(%info, "connected"));
                self.inner.events.publish(ConnectionEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.inner
                    .span
                    .in_scope(|| warn!(%info, error = %e, "failed to connect"));
                self.inner
                    .events
                    .publish(ConnectionEvent::FailedToConnect(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<(), HubError> {
        let info = &self.inner.info;
        let connect = TcpStream::connect((info.host.as_str(), info.port));
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| HubError::Timeout(CONNECT_TIMEOUT))??;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "set_nodelay failed");
        }
        let remote = stream.peer_addr()?;

        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let udp = UdpSocket::bind(local).await?;
        udp.connect((remote.ip(), info.udp_port)).await?;
        let udp = Arc::new(udp);

        let (reader, writer) = stream.into_split();
        let (peer, write_loop) = Peer::new(
            PeerId::NIL,
            Some(remote),
            Box::new(writer),
            CancellationToken::new(),
        );
        let peer = Arc::new(peer);

        *self.inner.link.lock().await = Some(Link {
            peer: Arc::clone(&peer),
            udp: Arc::clone(&udp),
        });

        let this = self.clone();
        let write_peer = Arc::clone(&peer);
        tokio::spawn(
            async move {
                if let Err(e) = write_loop.run().await {
                    this.disconnect(&write_peer, DisconnectReason::Transport(e.to_string()))
                        .await;
                }
            }
            .instrument(self.inner.span.clone()),
        );

        let this = self.clone();
        let tcp_peer = Arc::clone(&peer);
        tokio::spawn(
            async move {
                let events = this.inner.events.clone();
                let reason = peer::read_loop(reader, tcp_peer.cancel_token(), |packet| {
                    events.publish(ConnectionEvent::Packet(packet));
                })
                .await;
                this.disconnect(&tcp_peer, reason).await;
            }
            .instrument(self.inner.span.clone()),
        );

        let events = self.inner.events.clone();
        let cancel = peer.cancel_token();
        tokio::spawn(
            async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let received = tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = udp.recv(&mut buf) => received,
                    };
                    match received {
                        Ok(len) if len < HEADER_SIZE => trace!(len, "ignoring runt datagram"),
                        Ok(len) => match Packet::from_datagram(&buf[..len]) {
                            Ok(packet) => events.publish(ConnectionEvent::UdpPacket(packet)),
                            Err(e) => warn!(error = %e, "discarding undecodable datagram"),
                        },
                        Err(e) => debug!(error = %e, "udp receive failed"),
                    }
                }
            }
            .instrument(self.inner.span.clone()),
        );

        Ok(())
    }

    /// Tear down `peer` if it is still the live link. A link that was
    /// already replaced by a newer `start` is closed silently.
    async fn disconnect(&self, peer: &Arc<Peer>, reason: DisconnectReason) {
        if !peer.mark_disconnected() {
            return;
        }
        {
            let mut link = self.inner.link.lock().await;
            if link.as_ref().is_some_and(|l| Arc::ptr_eq(&l.peer, peer)) {
                *link = None;
            }
        }
        peer.close();
        self.inner
            .span
            .in_scope(|| info!(%reason, "disconnected from server"));
        self.inner
            .events
            .publish(ConnectionEvent::Disconnected(reason));
    }

    async fn live_peer(&self) -> Result<Arc<Peer>, HubError> {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|l| Arc::clone(&l.peer))
            .ok_or(HubError::NotConnected)
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), HubError> {
        let peer = self.live_peer().await?;
        trace!(packet = %packet.summary(), "sending");
        if let Err(e) = peer.send(packet).await {
            self.disconnect(&peer, DisconnectReason::Transport(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn send_udp(&self, packet: &Packet) -> Result<(), HubError> {
        let udp = self
            .inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|l| Arc::clone(&l.udp))
            .ok_or(HubError::NotConnected)?;
        let datagram = packet.to_bytes()?;
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(HubError::PayloadTooLarge {
                size: datagram.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        udp.send(&datagram).await?;
        Ok(())
    }

    /// Send `packet` and wait for a reply on the TCP stream.
    pub async fn send_and_await_response(
        &self,
        packet: &Packet,
        request: AwaitResponse,
    ) -> Result<RequestOutcome, HubError> {
        use futures::StreamExt;

        let replies = self.subscribe().into_stream().filter_map(|event| {
            futures::future::ready(match event {
                ConnectionEvent::Packet(packet) => Some(packet),
                _ => None,
            })
        });

        let pending = PendingRequest::register(replies, request, self.inner.span.clone());
        if let Err(e) = self.send(packet).await {
            pending.cancel();
            return Err(e);
        }
        pending.outcome().await
    }

    /// Close the link. Goes through the same path as a remote disconnect.
    pub async fn shutdown(&self) {
        let peer = self.inner.link.lock().await.as_ref().map(|l| Arc::clone(&l.peer));
        if let Some(peer) = peer {
            self.disconnect(&peer, DisconnectReason::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn udp_port_defaults_to_next_port() {
        let info = ConnectionInfo::new("localhost", 10356);
        assert_eq!(info.udp_port, 10357);
        assert_eq!(info.to_string(), "localhost:10356");
        assert_eq!(info.with_udp_port(9).udp_port, 9);
    }

    #[tokio::test]
    async fn refused_connect_publishes_failure() {
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let connection = Connection::new(ConnectionInfo::new("127.0.0.1", port), Span::none());
        let mut events = connection.subscribe();

        assert!(connection.start().await.is_err());
        assert!(matches!(
            timeout(WAIT, events.recv()).await.unwrap(),
            Some(ConnectionEvent::FailedToConnect(_))
        ));
        assert!(matches!(
            connection.send(&Packet::heartbeat()).await,
            Err(HubError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn shutdown_reports_disconnect_once() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { server.accept().await.unwrap() });

        let connection = Connection::new(ConnectionInfo::new("127.0.0.1", port), Span::none());
        let mut events = connection.subscribe();
        connection.start().await.unwrap();
        let _server_side = accept.await.unwrap();

        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));
        connection.shutdown().await;
        connection.shutdown().await;
        assert_eq!(
            timeout(WAIT, events.recv()).await.unwrap(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::Shutdown))
        );
        assert!(!connection.is_connected().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_none());
    }
}
