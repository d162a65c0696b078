//! Relay endpoint details
//!
//! The directory collaborator hands these to the circuit layer as CREATE
//! and EXTEND targets; nothing here fetches or parses directory documents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Everything the circuit layer needs to know about one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitNodeDetail {
    /// OR endpoint of the relay
    pub endpoint: SocketAddr,

    /// RSA identity fingerprint (SHA-1, 20 bytes)
    pub identity_fingerprint: [u8; 20],

    /// Curve25519 onion key for the ntor handshake
    pub ntor_onion_key: [u8; 32],
}

impl CircuitNodeDetail {
    pub fn new(
        endpoint: SocketAddr,
        identity_fingerprint: [u8; 20],
        ntor_onion_key: [u8; 32],
    ) -> Self {
        Self {
            endpoint,
            identity_fingerprint,
            ntor_onion_key,
        }
    }

    /// Fingerprint in the conventional upper-case hex form.
    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(self.identity_fingerprint)
    }
}

impl fmt::Display for CircuitNodeDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, &self.fingerprint_hex()[..8])
    }
}
