//! Error types for the circuit engine
//!
//! The taxonomy separates failures by blast radius:
//! - transport and framing errors kill the whole guard connection,
//! - integrity errors kill a single circuit,
//! - allocation and closed-resource errors are local to one call.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the circuit engine
#[derive(Error, Debug, Clone)]
pub enum TorError {
    /// Connection-level I/O failure. Fatal to the guard connection and to
    /// every circuit multiplexed on it; the caller decides whether to
    /// reconnect.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed cell, out-of-order handshake cell or unknown command.
    /// Fatal to the connection: once framing is suspect nothing that
    /// follows can be parsed safely.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Relay-cell digest mismatch, or a relay cell no hop recognized.
    /// Fatal to the owning circuit only.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Key agreement failed (bad server material or authentication tag).
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Random circuit-id allocation exhausted its retry budget.
    #[error("All circuit ids are taken, giving up")]
    CircuitIdExhausted,

    /// Random stream-id allocation exhausted its retry budget.
    #[error("All stream ids are taken, giving up")]
    StreamIdExhausted,

    /// Operation attempted on a circuit that received DESTROY or whose
    /// connection died. Surfaced to every pending stream operation.
    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    /// The remote side ended the stream, or the stream was closed locally.
    #[error("Stream closed (reason {reason})")]
    StreamClosed { reason: u8 },

    /// Application-layer request failed (e.g. a directory fetch returning
    /// a non-success status). Distinguishable from transport and protocol
    /// failures so callers can retry sensibly.
    #[error("Unsuccessful request: {0}")]
    UnsuccessfulRequest(String),

    /// Invariant violation inside the engine.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// True when the whole guard connection must be torn down.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, TorError::Transport(_) | TorError::Protocol(_))
    }

    /// True when only the owning circuit must be torn down.
    pub fn is_fatal_to_circuit(&self) -> bool {
        matches!(self, TorError::Integrity(_) | TorError::CircuitClosed(_))
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        TorError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blast_radius_classification() {
        assert!(TorError::Transport("eof".into()).is_fatal_to_connection());
        assert!(TorError::Protocol("bad cell".into()).is_fatal_to_connection());
        assert!(!TorError::Integrity("digest".into()).is_fatal_to_connection());

        assert!(TorError::Integrity("digest".into()).is_fatal_to_circuit());
        assert!(!TorError::CircuitIdExhausted.is_fatal_to_circuit());
    }

    #[test]
    fn io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed");
        match TorError::from(io) {
            TorError::Transport(msg) => assert!(msg.contains("closed")),
            other => panic!("expected Transport, got {other:?}"),
        }
    }
}
