//! Wire message types carried inside a [`Packet`](crate::packet::Packet).
//!
//! Every type here derives `serde` and is serialized with `bincode` as
//! part of the packet payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;
use crate::packet::Packet;
use crate::state::State;

// ── PeerId ───────────────────────────────────────────────────────

/// Opaque identifier of one live connection.
///
/// Generated by the listener for every accepted socket and never reused
/// within a process. The nil id stands for the server itself (and for a
/// client that has not completed its handshake yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// The server's own id.
    pub const NIL: PeerId = PeerId(Uuid::nil());

    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PeerId {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(PeerId)
            .map_err(|e| HubError::Other(format!("invalid peer id {s:?}: {e}")))
    }
}

impl From<Uuid> for PeerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ── User ─────────────────────────────────────────────────────────

/// One roster entry. Users are equal for roster purposes when their ids match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: PeerId,
    pub name: String,
}

impl User {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The identity the server uses for packets it originates.
    pub fn host() -> Self {
        Self::new(PeerId::NIL, "HOST")
    }
}

// ── Connect ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientType {
    /// A full participant that joins the roster.
    User,
    /// A read-only observer that only wants a copy of the state.
    TemporaryConnection,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// First packet a client sends after its TCP stream is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub client_type: ClientType,
    pub name: String,
    pub password: String,
    pub user_id: String,
    pub client_version: u32,
}

// ── ConnectResponse ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub response_type: ResponseType,
    pub message: String,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Success,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Fail,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_type == ResponseType::Success
    }
}

/// The server's answer to [`Connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub response: Response,
    /// The user created for this connection (`None` for observers and failures).
    pub self_user: Option<User>,
    /// Full roster snapshot (`None` on failure).
    pub state: Option<State>,
    pub server_version: u32,
}

// ── Command ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    /// Periodic keep-alive.
    Heartbeat,
    /// Application-defined command relayed between clients.
    Custom(String),
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandType::Heartbeat => write!(f, "Heartbeat"),
            CommandType::Custom(name) => write!(f, "Custom({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command_type: CommandType,
}

impl Command {
    pub fn heartbeat() -> Self {
        Self {
            command_type: CommandType::Heartbeat,
        }
    }
}

// ── Event ────────────────────────────────────────────────────────

/// Roster change replicated from the server to every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserAdded(User),
    UserUpdated(User),
    UserLeft(User),
}

impl Event {
    pub fn user(&self) -> &User {
        match self {
            Event::UserAdded(user) | Event::UserUpdated(user) | Event::UserLeft(user) => user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::UserAdded(_) => "UserAdded",
            Event::UserUpdated(_) => "UserUpdated",
            Event::UserLeft(_) => "UserLeft",
        }
    }
}

// ── Acknowledgement ──────────────────────────────────────────────

/// Confirms delivery of the packet with `packet_id`. Nothing emits these
/// automatically; they are surfaced to subscribers when received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub packet_id: Uuid,
}

// ── Frame ────────────────────────────────────────────────────────

/// An opaque, already-encoded media frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Milliseconds since the Unix epoch, set by the producer.
    pub timestamp: i64,
    pub file_id: String,
    pub compressed: bool,
    pub data: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("file_id", &self.file_id)
            .field("compressed", &self.compressed)
            .field("data_len", &self.data.len())
            .finish()
    }
}

// ── ForwardingPacket ─────────────────────────────────────────────

/// A packet the server relays, unread, to `destinations`.
///
/// The inner packet is kept in its serialized form so the relay never
/// has to interpret it and so nesting can never recurse during decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingPacket {
    inner: Vec<u8>,
    pub destinations: Vec<PeerId>,
}

impl ForwardingPacket {
    pub fn new(packet: &Packet, destinations: Vec<PeerId>) -> Result<Self, HubError> {
        Ok(Self {
            inner: packet.payload_bytes()?,
            destinations,
        })
    }

    /// Decode the wrapped packet.
    pub fn packet(&self) -> Result<Packet, HubError> {
        Packet::from_payload_bytes(&self.inner)
    }
}
