//! One live TCP stream and the loops that drive it.
//!
//! Reads happen in [`read_loop`]. Writes go through a bounded per-peer
//! queue drained by a [`WriteLoop`], so a caller never waits on another
//! peer's socket and writes to one stream are never interleaved.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::codec::{self, FrameCodec};
use crate::error::HubError;
use crate::message::PeerId;
use crate::packet::Packet;

/// Size of each socket read.
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Envelopes that may wait for one peer's socket before it counts as stalled.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a stream ended. Every cause goes through the same cleanup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the stream.
    Eof,
    /// A read or write failed.
    Transport(String),
    /// Closed locally.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "end of stream"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Handle to one stream: its outbound queue plus lifecycle flags.
pub struct Peer {
    id: PeerId,
    addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Bytes>,
    disconnected: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Peer {
    /// Build the handle and the loop that owns the write half. The caller
    /// spawns the loop and routes its error into its disconnect path.
    pub(crate) fn new(
        id: PeerId,
        addr: Option<SocketAddr>,
        writer: BoxedWriter,
        cancel: CancellationToken,
    ) -> (Self, WriteLoop) {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let write_loop = WriteLoop {
            id,
            queue,
            sink: FramedWrite::new(writer, FrameCodec::new()),
            cancel: cancel.clone(),
        };
        let peer = Self {
            id,
            addr,
            outbound,
            disconnected: AtomicBool::new(false),
            cancel,
        };
        (peer, write_loop)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Queue `packet`, waiting for room if the queue is full.
    pub async fn send(&self, packet: &Packet) -> Result<(), HubError> {
        if self.is_disconnected() {
            return Err(HubError::NotConnected);
        }
        self.outbound.send(codec::encode_envelope(packet)?).await?;
        Ok(())
    }

    /// Queue an already-encoded envelope without waiting. A full queue
    /// means the remote has stopped reading.
    pub fn try_send_envelope(&self, envelope: Bytes) -> Result<(), HubError> {
        if self.is_disconnected() {
            return Err(HubError::NotConnected);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => HubError::QueueFull(OUTBOUND_QUEUE_CAPACITY),
            TrySendError::Closed(_) => HubError::ChannelClosed,
        })
    }

    /// Mark the peer as gone. Returns `true` only for the first caller,
    /// who then owns cleanup.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.disconnected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop both loops. The write loop shuts the write half down on exit.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

/// Drains one peer's outbound queue onto its write half.
pub(crate) struct WriteLoop {
    id: PeerId,
    queue: mpsc::Receiver<Bytes>,
    sink: FramedWrite<BoxedWriter, FrameCodec>,
    cancel: CancellationToken,
}

impl WriteLoop {
    /// Write queued envelopes in order until cancelled or the handle is
    /// dropped. A stalled write is abandoned on cancel.
    pub(crate) async fn run(mut self) -> Result<(), HubError> {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                written = self.sink.send(envelope) => written?,
            }
        }
        self.queue.close();
        if let Err(e) = self.sink.get_mut().shutdown().await {
            trace!(peer = %self.id, error = %e, "write half shutdown failed");
        }
        Ok(())
    }
}

/// Read envelopes from `reader` until the stream ends or `cancel` fires.
///
/// Undecodable envelopes are logged and skipped; the codec has already
/// discarded their bytes. Only a read error or end of stream stops the loop.
pub async fn read_loop<R, F>(reader: R, cancel: CancellationToken, mut on_packet: F) -> DisconnectReason
where
    R: AsyncRead + Unpin,
    F: FnMut(Packet),
{
    let mut frames = FramedRead::with_capacity(reader, FrameCodec::new(), READ_BUFFER_SIZE);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return DisconnectReason::Shutdown,
            next = frames.next() => next,
        };

        match next {
            None => return DisconnectReason::Eof,
            Some(Ok(Ok(packet))) => {
                trace!(packet = %packet.summary(), "received");
                on_packet(packet);
            }
            Some(Ok(Err(failure))) => warn!(%failure, "discarding undecodable envelope"),
            Some(Err(e)) => return DisconnectReason::Transport(e.to_string()),
        }
    }
}
