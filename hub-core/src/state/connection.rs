//! Client session lifecycle.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::Instant;

use crate::error::HubError;

/// The current phase of a client session.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲               │  ▲           │
///       └───────────────┘  └───────────┘
///         connect failed     heartbeat / stream failure
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No live stream. Initial state and the state after a failed attempt.
    #[default]
    Disconnected,

    /// A connect attempt is in flight; heartbeats are paused.
    Connecting,

    /// The TCP stream is up.
    Connected {
        /// When the session entered the `Connected` state.
        since: Instant,
    },
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
        }
    }
}

impl SessionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the session has been connected, if it is.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected`, `Connected` (failure detected).
    pub fn begin_connect(&mut self) -> Result<(), HubError> {
        match self {
            Self::Disconnected | Self::Connected { .. } => {
                *self = Self::Connecting;
                Ok(())
            }
            Self::Connecting => Err(HubError::ProtocolViolation(
                "cannot connect: attempt already in flight",
            )),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), HubError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(HubError::ProtocolViolation(
                "cannot complete connect: not in Connecting state",
            )),
        }
    }

    /// Transition to `Disconnected` after a failed attempt.
    ///
    /// Valid from: `Connecting`.
    pub fn fail_connect(&mut self) -> Result<(), HubError> {
        match self {
            Self::Connecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(HubError::ProtocolViolation(
                "cannot fail connect: not in Connecting state",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::default();
        assert!(phase.is_disconnected());

        phase.begin_connect().unwrap();
        assert!(phase.is_connecting());

        phase.complete_connect().unwrap();
        assert!(phase.is_connected());
        assert!(phase.connected_duration().is_some());
    }

    #[test]
    fn reconnect_from_connected() {
        let mut phase = SessionPhase::Connected {
            since: Instant::now(),
        };
        phase.begin_connect().unwrap();
        assert!(phase.is_connecting());
    }

    #[test]
    fn failed_connect_returns_to_disconnected() {
        let mut phase = SessionPhase::Connecting;
        phase.fail_connect().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn double_connect_is_rejected() {
        let mut phase = SessionPhase::Connecting;
        assert!(phase.begin_connect().is_err());
    }

    #[test]
    fn invalid_complete_from_disconnected() {
        let mut phase = SessionPhase::Disconnected;
        assert!(phase.complete_connect().is_err());
        assert!(phase.fail_connect().is_err());
    }

    #[test]
    fn force_disconnect_from_any_state() {
        let mut phase = SessionPhase::Connected {
            since: Instant::now(),
        };
        phase.force_disconnect();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn display_format() {
        assert_eq!(SessionPhase::Disconnected.to_string(), "Disconnected");
        assert_eq!(SessionPhase::Connecting.to_string(), "Connecting");
        assert_eq!(
            SessionPhase::Connected {
                since: Instant::now()
            }
            .to_string(),
            "Connected"
        );
    }
}
