//! Key agreement
//!
//! Both circuit handshakes share one two-call shape: produce client key
//! material for the CREATE/EXTEND cell, then turn the server's response
//! into derived key material. The circuit layer only sees the trait, so
//! hop state construction is identical for both families.

use crate::crypto::{compute_legacy_kdf, KdfResult};
use crate::error::{Result, TorError};
use crate::protocol::cell::FAST_KEY_MATERIAL_LEN;
use crate::protocol::node::CircuitNodeDetail;
use crate::protocol::ntor::{NtorClient, NTOR_SERVER_RESPONSE_LEN};
use rand::rngs::OsRng;
use rand::Rng;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// One circuit handshake in progress.
pub trait KeyAgreement: Send {
    /// Client key material embedded in the outgoing CREATE/EXTEND cell.
    fn client_material(&self) -> Vec<u8>;

    /// Derive hop keys from the server's handshake response.
    fn derive_keys(&self, server_response: &[u8]) -> Result<KdfResult>;
}

/// CREATE_FAST: the client's 20 random bytes go out in the clear and the
/// server's 20 bytes come back with a KDF confirmation. No relay identity
/// is authenticated; only the first hop may use this, and only because the
/// transport already authenticated the guard.
pub struct FastKeyAgreement {
    x: [u8; FAST_KEY_MATERIAL_LEN],
}

impl FastKeyAgreement {
    pub fn new() -> Self {
        let mut x = [0u8; FAST_KEY_MATERIAL_LEN];
        for byte in x.iter_mut() {
            // Matches the reference generator: every byte non-zero.
            *byte = OsRng.gen_range(1..=255);
        }
        Self { x }
    }

    /// Fixed key material, for deterministic vectors.
    pub fn from_material(x: [u8; FAST_KEY_MATERIAL_LEN]) -> Self {
        Self { x }
    }
}

impl Default for FastKeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FastKeyAgreement {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

impl KeyAgreement for FastKeyAgreement {
    fn client_material(&self) -> Vec<u8> {
        self.x.to_vec()
    }

    /// `server_response` is Y (20 bytes) followed by the derivative key
    /// data echoing the KDF's handshake key. K0 = X | Y.
    fn derive_keys(&self, server_response: &[u8]) -> Result<KdfResult> {
        if server_response.len() < 2 * FAST_KEY_MATERIAL_LEN {
            return Err(TorError::HandshakeFailed(format!(
                "CREATED_FAST response too short: {} bytes",
                server_response.len()
            )));
        }
        let y = &server_response[..FAST_KEY_MATERIAL_LEN];
        let derivative_key_data = &server_response[FAST_KEY_MATERIAL_LEN..2 * FAST_KEY_MATERIAL_LEN];

        let mut k0 = Vec::with_capacity(2 * FAST_KEY_MATERIAL_LEN);
        k0.extend_from_slice(&self.x);
        k0.extend_from_slice(y);
        let kdf = compute_legacy_kdf(&k0);
        k0.zeroize();

        if !bool::from(kdf.key_handshake.ct_eq(derivative_key_data)) {
            return Err(TorError::HandshakeFailed(
                "CREATED_FAST derivative key data mismatch".into(),
            ));
        }

        Ok(kdf)
    }
}

/// ntor: authenticated Diffie-Hellman against the relay's onion key.
pub struct NtorKeyAgreement {
    client: NtorClient,
}

impl NtorKeyAgreement {
    pub fn new(node: &CircuitNodeDetail) -> Self {
        Self {
            client: NtorClient::new(node),
        }
    }
}

impl KeyAgreement for NtorKeyAgreement {
    fn client_material(&self) -> Vec<u8> {
        self.client.handshake_data()
    }

    /// `server_response` is Y (32 bytes) followed by AUTH (32 bytes).
    fn derive_keys(&self, server_response: &[u8]) -> Result<KdfResult> {
        if server_response.len() < NTOR_SERVER_RESPONSE_LEN {
            return Err(TorError::HandshakeFailed(format!(
                "CREATED2 ntor response too short: {} bytes",
                server_response.len()
            )));
        }
        let key_seed = self.client.complete(server_response)?;
        crate::crypto::compute_ntor_kdf(&key_seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::compute_legacy_kdf;

    fn emulated_created_fast(x: &[u8], y: [u8; 20]) -> Vec<u8> {
        // What an honest relay sends back: Y plus the KDF handshake key.
        let mut k0 = x.to_vec();
        k0.extend_from_slice(&y);
        let kdf = compute_legacy_kdf(&k0);
        let mut response = y.to_vec();
        response.extend_from_slice(&kdf.key_handshake);
        response
    }

    #[test]
    fn fast_material_is_nonzero_and_fresh() {
        let a = FastKeyAgreement::new();
        let b = FastKeyAgreement::new();
        assert!(a.client_material().iter().all(|&byte| byte != 0));
        assert_eq!(a.client_material().len(), FAST_KEY_MATERIAL_LEN);
        assert_ne!(a.client_material(), b.client_material());
    }

    #[test]
    fn fast_agreement_derives_kdf_of_concatenated_material() {
        let x = [0x11u8; 20];
        let y = [0x22u8; 20];
        let agreement = FastKeyAgreement::from_material(x);
        let response = emulated_created_fast(&x, y);

        let kdf = agreement.derive_keys(&response).unwrap();

        let mut k0 = x.to_vec();
        k0.extend_from_slice(&y);
        let expected = compute_legacy_kdf(&k0);
        assert_eq!(kdf.forward_key, expected.forward_key);
        assert_eq!(kdf.backward_key, expected.backward_key);
        assert_eq!(kdf.forward_digest, expected.forward_digest);
    }

    #[test]
    fn fast_agreement_rejects_bad_confirmation() {
        let x = [0x11u8; 20];
        let agreement = FastKeyAgreement::from_material(x);

        let mut response = vec![0x22u8; 20];
        response.extend_from_slice(&[0u8; 20]); // wrong derivative key data

        match agreement.derive_keys(&response) {
            Err(TorError::HandshakeFailed(_)) => {}
            other => panic!("expected handshake failure, got {other:?}"),
        }
    }

    #[test]
    fn fast_agreement_rejects_short_response() {
        let agreement = FastKeyAgreement::new();
        assert!(agreement.derive_keys(&[0u8; 39]).is_err());
    }
}
