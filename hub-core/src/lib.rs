//! # hub-core
//!
//! Core library for a hub-and-spoke relay: one server, many clients, all
//! client-to-client traffic routed through the server.
//!
//! This crate contains:
//! - **Framing**: `EnvelopeHeader`, `Packet`, and `FrameCodec` for `tokio_util`
//!   framed I/O with resynchronization after corrupt input
//! - **Messages**: `Connect`, `ConnectResponse`, `Command`, `Event`,
//!   `Acknowledgement`, `Frame`, `ForwardingPacket`
//! - **Network**: `Listener` (server) and `Connection` (client) over TCP + UDP,
//!   plus request/response correlation
//! - **State**: the replicated roster and the client session phase machine
//! - **Session**: `HubServer` and `HubClient` implementing the handshake,
//!   heartbeat reconnect, roster replication and forwarding
//! - **Config**: JSON `ConfigStore`
//! - **Error**: `HubError`, a typed `thiserror`-based error hierarchy

pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod message;
pub mod network;
pub mod packet;
pub mod session;
pub mod state;

/// Human-readable build version, reported in handshake failures.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handshake compatibility code. Clients and server must match exactly.
pub const VERSION_CODE: u32 = 1;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::FrameCodec;
pub use config::{ConfigStore, ServerConfig, DEFAULT_PORT};
pub use error::HubError;
pub use header::{EnvelopeHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    Acknowledgement, ClientType, Command, CommandType, Connect, ConnectResponse, Event,
    ForwardingPacket, Frame, PeerId, Response, ResponseType, User,
};
pub use network::{
    AwaitResponse, Connection, ConnectionEvent, ConnectionInfo, DisconnectReason, EventBus,
    Listener, ListenerConfig, ListenerEvent, RequestOutcome, Subscription,
};
pub use packet::{DecodeFailure, Packet, Payload};
pub use session::{ClientEvent, ClientOptions, HubClient, HubServer, ServerEvent, ServerOptions};
pub use state::{ServerSettings, SessionPhase, State};
