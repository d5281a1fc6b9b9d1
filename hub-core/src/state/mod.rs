pub mod connection;
pub mod roster;

pub use connection::SessionPhase;
pub use roster::{REDACTED_PASSWORD, ServerSettings, State};
