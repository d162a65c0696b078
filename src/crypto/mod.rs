//! Circuit cryptography
//!
//! Stream cipher, running digest, key derivation and the per-hop crypto
//! state assembled from them. Key agreement itself (CREATE_FAST, ntor)
//! lives in the protocol layer; everything here is deterministic transform
//! state.

mod cipher;
mod digest;
mod kdf;

pub use cipher::{TorStreamCipher, CIPHER_BLOCK_LEN, CIPHER_KEY_LEN};
pub use digest::{TorMessageDigest, TOR_DIGEST256_LEN, TOR_DIGEST_LEN};
pub use kdf::{compute_legacy_kdf, compute_ntor_kdf, KdfResult, KDF_HASH_LEN, KDF_KEY_LEN};

/// Cipher and digest state for one circuit hop.
///
/// All four members are derived once, together, from a single KDF result
/// and never re-derived for the lifetime of the hop. The owning circuit
/// mutates them exclusively from its send and receive paths; the running
/// digests make every transform order-dependent.
pub struct TorCryptoState {
    /// Encrypts one onion layer on outgoing relay cells
    pub forward_cipher: TorStreamCipher,

    /// Strips this hop's layer from incoming relay cells
    pub backward_cipher: TorStreamCipher,

    /// Running digest over outgoing relay cells to this hop
    pub forward_digest: TorMessageDigest,

    /// Running digest over incoming relay cells from this hop
    pub backward_digest: TorMessageDigest,
}

impl TorCryptoState {
    /// Build hop state from derived key material. Ciphers start from a
    /// zero counter; digests are seeded with the KDF digest seeds.
    pub fn from_kdf_result(kdf: &KdfResult) -> crate::error::Result<Self> {
        let forward_cipher = TorStreamCipher::new(&kdf.forward_key)?;
        let backward_cipher = TorStreamCipher::new(&kdf.backward_key)?;

        let mut forward_digest = TorMessageDigest::new();
        forward_digest.update(&kdf.forward_digest);

        let mut backward_digest = TorMessageDigest::new();
        backward_digest.update(&kdf.backward_digest);

        Ok(Self {
            forward_cipher,
            backward_cipher,
            forward_digest,
            backward_digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_state_seeds_digests_from_kdf() {
        let kdf = compute_legacy_kdf(&[0u8; 40]);
        let state = TorCryptoState::from_kdf_result(&kdf).unwrap();

        let mut expected = TorMessageDigest::new();
        expected.update(&kdf.forward_digest);
        assert_eq!(
            state.forward_digest.current_digest(),
            expected.current_digest()
        );

        let mut expected = TorMessageDigest::new();
        expected.update(&kdf.backward_digest);
        assert_eq!(
            state.backward_digest.current_digest(),
            expected.current_digest()
        );
    }

    #[test]
    fn paired_states_invert_each_other() {
        // A client state and a relay state built from the same KDF result:
        // the relay strips the client's forward layer with an identical
        // keystream.
        let kdf = compute_legacy_kdf(b"shared between both ends");
        let mut client = TorCryptoState::from_kdf_result(&kdf).unwrap();
        let mut relay = TorCryptoState::from_kdf_result(&kdf).unwrap();

        let mut cell = vec![0x5au8; 509];
        let original = cell.clone();

        client.forward_cipher.apply(&mut cell);
        assert_ne!(cell, original);
        relay.forward_cipher.apply(&mut cell);
        assert_eq!(cell, original);
    }
}
