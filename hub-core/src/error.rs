//! Domain-specific error types for the hub protocol.
//!
//! All fallible operations return `Result<T, HubError>`.
//! No panics on peer input: every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

use crate::message::PeerId;

/// The canonical error type for the hub protocol.
#[derive(Debug, Error)]
pub enum HubError {
    // ── Framing Errors ───────────────────────────────────────────
    /// Bytes at the read cursor do not start with the envelope magic.
    #[error("invalid magic bytes: expected HUB1")]
    InvalidMagic,

    /// A field in the envelope header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The envelope payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The payload exceeds the maximum envelope size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Fewer bytes were supplied than the envelope header declares.
    #[error("truncated envelope: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The payload could not be deserialized into a packet.
    #[error("decode error: {0}")]
    Decode(String),

    // ── Serialization Errors ─────────────────────────────────────
    /// A packet could not be serialized.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A send was attempted on a connection that is not established.
    #[error("not connected")]
    NotConnected,

    /// No live peer is registered under this id.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// A channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// A peer's outbound queue is full; the remote has stopped reading.
    #[error("outbound queue full ({0} envelopes)")]
    QueueFull(usize),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Protocol Errors ──────────────────────────────────────────
    /// The peer runs an incompatible build.
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Framing errors are recovered by discarding bytes; they never tear
    /// down a connection.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            HubError::InvalidMagic
                | HubError::InvalidHeader(_)
                | HubError::ChecksumMismatch
                | HubError::PayloadTooLarge { .. }
                | HubError::Truncated { .. }
                | HubError::Decode(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for HubError {
    fn from(s: String) -> Self {
        HubError::Other(s)
    }
}

impl From<&str> for HubError {
    fn from(s: &str) -> Self {
        HubError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for HubError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        HubError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for HubError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        HubError::ChannelClosed
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = HubError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = HubError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = HubError::VersionMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(e.to_string().contains("expected 1"));
    }

    #[test]
    fn from_string() {
        let e: HubError = "something broke".into();
        assert!(matches!(e, HubError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: HubError = io_err.into();
        assert!(matches!(e, HubError::Connection(_)));
        assert!(!e.is_framing());
    }

    #[test]
    fn framing_classification() {
        assert!(HubError::ChecksumMismatch.is_framing());
        assert!(HubError::Decode("bad".into()).is_framing());
        assert!(!HubError::NotConnected.is_framing());
    }
}
