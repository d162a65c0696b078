//! ntor handshake
//!
//! X25519-based key exchange used by CREATE2/EXTEND2. The client sends
//! `ID | B | X` (84 bytes) and receives `Y | AUTH` (64 bytes); both sides
//! derive KEY_SEED and the server proves key possession through the AUTH
//! tag. AUTH verification is constant-time.
//!
//! Reference: spec.torproject.org/tor-spec/create-created-cells.html

use crate::error::{Result, TorError};
use crate::protocol::node::CircuitNodeDetail;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// Client key material size on the wire: ID(20) | B(32) | X(32).
pub const NTOR_CLIENT_MATERIAL_LEN: usize = 84;

/// Server reply size: Y(32) | AUTH(32).
pub const NTOR_SERVER_RESPONSE_LEN: usize = 64;

/// Client side of one ntor exchange.
///
/// Holds the ephemeral secret between sending the handshake data and
/// processing the server reply. The secret zeroizes on drop through
/// `x25519_dalek`.
pub struct NtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
    relay_identity: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorClient {
    /// Start an exchange toward `node` with a fresh ephemeral keypair.
    pub fn new(node: &CircuitNodeDetail) -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            relay_identity: node.identity_fingerprint,
            relay_onion_key: PublicKey::from(node.ntor_onion_key),
        }
    }

    /// The 84-byte client message: `ID | B | X`.
    pub fn handshake_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(NTOR_CLIENT_MATERIAL_LEN);
        data.extend_from_slice(&self.relay_identity);
        data.extend_from_slice(self.relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Process the server's `Y | AUTH` reply and return KEY_SEED.
    pub fn complete(&self, server_response: &[u8]) -> Result<[u8; 32]> {
        if server_response.len() < NTOR_SERVER_RESPONSE_LEN {
            return Err(TorError::HandshakeFailed(format!(
                "ntor server response too short: {} bytes",
                server_response.len()
            )));
        }

        let mut server_public_bytes = [0u8; 32];
        server_public_bytes.copy_from_slice(&server_response[..32]);
        let server_public = PublicKey::from(server_public_bytes);

        let mut server_auth = [0u8; 32];
        server_auth.copy_from_slice(&server_response[32..64]);

        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.relay_onion_key);

        // secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
        let mut secret_input = Vec::with_capacity(32 * 5 + 20 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.relay_identity);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_tag(T_KEY, &secret_input);
        let verify = hmac_tag(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_identity);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_tag(T_MAC, &auth_input);

        if !bool::from(computed_auth.ct_eq(&server_auth)) {
            return Err(TorError::HandshakeFailed(
                "ntor server AUTH verification failed".into(),
            ));
        }

        Ok(key_seed)
    }
}

fn hmac_tag(key: &[u8], input: &[u8]) -> [u8; 32] {
    // HMAC accepts any key length; this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!(),
    };
    mac.update(input);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_node() -> (CircuitNodeDetail, StaticSecret) {
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_public = PublicKey::from(&onion_secret);
        let endpoint: SocketAddr = "198.51.100.9:9001".parse().unwrap();
        let node = CircuitNodeDetail::new(endpoint, [0x21; 20], *onion_public.as_bytes());
        (node, onion_secret)
    }

    #[test]
    fn handshake_data_layout() {
        let (node, _) = test_node();
        let client = NtorClient::new(&node);
        let data = client.handshake_data();

        assert_eq!(data.len(), NTOR_CLIENT_MATERIAL_LEN);
        assert_eq!(&data[..20], &node.identity_fingerprint);
        assert_eq!(&data[20..52], &node.ntor_onion_key);
        assert_eq!(&data[52..84], client.client_public.as_bytes());
    }

    /// Emulate the relay side of the exchange and check both ends agree on
    /// KEY_SEED and that a valid AUTH is accepted.
    #[test]
    fn full_exchange_against_emulated_relay() {
        let (node, onion_secret) = test_node();
        let client = NtorClient::new(&node);
        let client_material = client.handshake_data();

        // Relay side: ephemeral y, computes EXP(X,y) and EXP(X,b).
        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);
        let mut client_public_bytes = [0u8; 32];
        client_public_bytes.copy_from_slice(&client_material[52..84]);
        let client_public = PublicKey::from(client_public_bytes);

        let shared_xy = server_secret.diffie_hellman(&client_public);
        let shared_xb = onion_secret.diffie_hellman(&client_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared_xy.as_bytes());
        secret_input.extend_from_slice(shared_xb.as_bytes());
        secret_input.extend_from_slice(&node.identity_fingerprint);
        secret_input.extend_from_slice(&node.ntor_onion_key);
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let server_key_seed = hmac_tag(T_KEY, &secret_input);
        let verify = hmac_tag(T_VERIFY, &secret_input);

        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&node.identity_fingerprint);
        auth_input.extend_from_slice(&node.ntor_onion_key);
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let auth = hmac_tag(T_MAC, &auth_input);

        let mut response = Vec::new();
        response.extend_from_slice(server_public.as_bytes());
        response.extend_from_slice(&auth);

        let key_seed = client.complete(&response).unwrap();
        assert_eq!(key_seed, server_key_seed);
    }

    #[test]
    fn corrupted_auth_rejected() {
        let (node, onion_secret) = test_node();
        let client = NtorClient::new(&node);

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);
        let _ = onion_secret;

        // A response with a garbage AUTH must fail closed.
        let mut response = Vec::new();
        response.extend_from_slice(server_public.as_bytes());
        response.extend_from_slice(&[0u8; 32]);

        match client.complete(&response) {
            Err(TorError::HandshakeFailed(_)) => {}
            other => panic!("expected handshake failure, got {other:?}"),
        }
    }

    #[test]
    fn short_response_rejected() {
        let (node, _) = test_node();
        let client = NtorClient::new(&node);
        assert!(client.complete(&[0u8; 63]).is_err());
    }
}
