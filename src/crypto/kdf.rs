//! Key derivation
//!
//! Both handshake families expand a shared secret into the same shape: a
//! forward/backward key pair for the hop ciphers plus forward/backward
//! digest seeds, so per-hop crypto state construction is uniform.
//!
//! - The legacy KDF (CREATE_FAST) hashes `K0 || counter` with SHA-1 for an
//!   incrementing one-byte counter and concatenates the outputs.
//! - The ntor KDF expands KEY_SEED with HKDF-SHA256.

use crate::error::{Result, TorError};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Cipher key size produced by both KDFs.
pub const KDF_KEY_LEN: usize = 16;

/// Digest seed size produced by both KDFs.
pub const KDF_HASH_LEN: usize = 20;

/// HKDF info string of the ntor handshake.
const NTOR_M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Derived key material for one hop.
///
/// Zeroized on drop: these bytes are the hop's session keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KdfResult {
    /// Handshake confirmation key. The legacy KDF produces it and
    /// CREATED_FAST echoes it back as derivative key data; the ntor KDF
    /// authenticates differently and leaves it empty.
    pub key_handshake: Vec<u8>,

    /// Seed committed to the forward running digest
    pub forward_digest: [u8; KDF_HASH_LEN],

    /// Seed committed to the backward running digest
    pub backward_digest: [u8; KDF_HASH_LEN],

    /// Forward (client to relay) cipher key
    pub forward_key: [u8; KDF_KEY_LEN],

    /// Backward (relay to client) cipher key
    pub backward_key: [u8; KDF_KEY_LEN],
}

impl std::fmt::Debug for KdfResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redacted: these fields are secret session key material.
        f.debug_struct("KdfResult").finish_non_exhaustive()
    }
}

/// Legacy KDF: SHA1(K0 || 0) || SHA1(K0 || 1) || ... sliced into
/// KeyHandshake, ForwardDigest, BackwardDigest, ForwardKey, BackwardKey
/// in that order.
pub fn compute_legacy_kdf(k0: &[u8]) -> KdfResult {
    const TARGET: usize = 2 * KDF_KEY_LEN + 3 * KDF_HASH_LEN;

    let mut stream = Vec::with_capacity(TARGET + KDF_HASH_LEN);
    let mut counter: u8 = 0;
    while stream.len() < TARGET {
        let mut hasher = sha1::Sha1::new();
        hasher.update(k0);
        hasher.update([counter]);
        stream.extend_from_slice(&hasher.finalize());
        counter += 1;
    }

    let mut forward_digest = [0u8; KDF_HASH_LEN];
    let mut backward_digest = [0u8; KDF_HASH_LEN];
    let mut forward_key = [0u8; KDF_KEY_LEN];
    let mut backward_key = [0u8; KDF_KEY_LEN];

    let key_handshake = stream[..KDF_HASH_LEN].to_vec();
    forward_digest.copy_from_slice(&stream[KDF_HASH_LEN..2 * KDF_HASH_LEN]);
    backward_digest.copy_from_slice(&stream[2 * KDF_HASH_LEN..3 * KDF_HASH_LEN]);
    forward_key.copy_from_slice(&stream[3 * KDF_HASH_LEN..3 * KDF_HASH_LEN + KDF_KEY_LEN]);
    backward_key.copy_from_slice(
        &stream[3 * KDF_HASH_LEN + KDF_KEY_LEN..3 * KDF_HASH_LEN + 2 * KDF_KEY_LEN],
    );

    stream.zeroize();

    KdfResult {
        key_handshake,
        forward_digest,
        backward_digest,
        forward_key,
        backward_key,
    }
}

/// ntor KDF: KEY_SEED is already an HMAC output, so it is used directly as
/// the HKDF pseudorandom key and expanded to Df | Db | Kf | Kb.
pub fn compute_ntor_kdf(key_seed: &[u8]) -> Result<KdfResult> {
    let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|_| TorError::HandshakeFailed("Invalid ntor KEY_SEED length".into()))?;

    let mut okm = [0u8; 2 * KDF_HASH_LEN + 2 * KDF_KEY_LEN];
    hkdf.expand(NTOR_M_EXPAND, &mut okm)
        .map_err(|_| TorError::HandshakeFailed("ntor key expansion failed".into()))?;

    let mut forward_digest = [0u8; KDF_HASH_LEN];
    let mut backward_digest = [0u8; KDF_HASH_LEN];
    let mut forward_key = [0u8; KDF_KEY_LEN];
    let mut backward_key = [0u8; KDF_KEY_LEN];

    forward_digest.copy_from_slice(&okm[..20]);
    backward_digest.copy_from_slice(&okm[20..40]);
    forward_key.copy_from_slice(&okm[40..56]);
    backward_key.copy_from_slice(&okm[56..72]);

    okm.zeroize();

    Ok(KdfResult {
        key_handshake: Vec::new(),
        forward_digest,
        backward_digest,
        forward_key,
        backward_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    /// Reference vector: seed of 40 zero bytes.
    #[test]
    fn legacy_kdf_reference_vector() {
        let k0 = [0u8; 2 * KDF_HASH_LEN];
        let result = compute_legacy_kdf(&k0);

        assert_eq!(
            result.key_handshake,
            unhex("669B1C85ECBAFE23C999100F55A23E06BF59EAD7")
        );
        assert_eq!(
            result.forward_digest.to_vec(),
            unhex("CD0783158D334E6BDCF2D0F68C4B18EF5F579874")
        );
        assert_eq!(
            result.backward_digest.to_vec(),
            unhex("F6E7194DD65C516A5805C4BA2311A7E6DA980A57")
        );
        assert_eq!(
            result.forward_key.to_vec(),
            unhex("7784611D3E42E10A6A5CB910A0008F2F")
        );
        assert_eq!(
            result.backward_key.to_vec(),
            unhex("9F929A229295E4A053B24C6A2D70578F")
        );
    }

    #[test]
    fn legacy_kdf_is_deterministic_and_seed_sensitive() {
        let a = compute_legacy_kdf(b"some shared secret");
        let b = compute_legacy_kdf(b"some shared secret");
        let c = compute_legacy_kdf(b"some other secret");

        assert_eq!(a.forward_key, b.forward_key);
        assert_eq!(a.backward_digest, b.backward_digest);
        assert_ne!(a.forward_key, c.forward_key);
    }

    #[test]
    fn ntor_kdf_shape() {
        let key_seed = [7u8; 32];
        let result = compute_ntor_kdf(&key_seed).unwrap();

        assert!(result.key_handshake.is_empty());
        assert_ne!(result.forward_key, result.backward_key);
        assert_ne!(result.forward_digest, result.backward_digest);

        let again = compute_ntor_kdf(&key_seed).unwrap();
        assert_eq!(result.forward_key, again.forward_key);
    }
}
