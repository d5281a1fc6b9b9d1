//! Session protocol on top of the transport: handshake, roster
//! replication, forwarding and heartbeats.

pub mod client;
pub mod server;

pub use client::{ClientEvent, ClientOptions, HubClient, DEFAULT_HEARTBEAT_INTERVAL};
pub use server::{HubServer, ServerEvent, ServerOptions};
