//! TCP + UDP transport.
//!
//! [`Listener`] is the server side, [`Connection`] the client side. Both
//! run the same per-stream read loop (see [`peer`]) and publish what they
//! observe on an [`EventBus`].

pub mod bus;
pub mod connection;
pub mod listener;
pub mod peer;
pub mod request;

pub use bus::{EventBus, Subscription};
pub use connection::{Connection, ConnectionEvent, ConnectionInfo};
pub use listener::{Listener, ListenerConfig, ListenerEvent};
pub use peer::{DisconnectReason, Peer};
pub use request::{AwaitResponse, PendingRequest, RequestOutcome, DEFAULT_REQUEST_TIMEOUT};
