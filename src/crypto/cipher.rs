//! Counter-mode stream cipher
//!
//! The onion-layer primitive: an AES keystream generated from a 128-bit
//! big-endian counter block, XORed byte-by-byte into the data. Applying it
//! twice with the same state restores the plaintext, so one type covers
//! both directions. Keystream position is kept across calls at byte
//! granularity; a cell boundary is not a keystream boundary.

use crate::error::{Result, TorError};
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Key size used by the relay protocol (AES-128).
pub const CIPHER_KEY_LEN: usize = 16;

/// Counter block size.
pub const CIPHER_BLOCK_LEN: usize = 16;

enum CipherKind {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

/// AES-CTR keystream generator.
///
/// The relay protocol uses 16-byte keys with an all-zero initial counter;
/// 32-byte keys are accepted for the larger-key variant. Mutable position
/// state means an instance must not be shared between unsynchronized
/// callers; exclusive ownership (`&mut self`) enforces that here.
pub struct TorStreamCipher {
    inner: CipherKind,
}

impl TorStreamCipher {
    /// Create a cipher with an all-zero initial counter.
    pub fn new(key: &[u8]) -> Result<Self> {
        Self::with_iv(key, &[0u8; CIPHER_BLOCK_LEN])
    }

    /// Create a cipher with an explicit initial counter. Deterministic
    /// test vectors need this; the relay protocol itself always starts
    /// from zero.
    pub fn with_iv(key: &[u8], iv: &[u8; CIPHER_BLOCK_LEN]) -> Result<Self> {
        let inner = match key.len() {
            16 => {
                let mut k = [0u8; 16];
                k.copy_from_slice(key);
                CipherKind::Aes128(Aes128Ctr::new(&k.into(), iv.into()))
            }
            32 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(key);
                CipherKind::Aes256(Aes256Ctr::new(&k.into(), iv.into()))
            }
            other => {
                return Err(TorError::Internal(format!(
                    "Unsupported stream cipher key length: {}",
                    other
                )))
            }
        };
        Ok(Self { inner })
    }

    /// XOR the keystream into `data` in place. Self-inverse.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.inner {
            CipherKind::Aes128(cipher) => cipher.apply_keystream(data),
            CipherKind::Aes256(cipher) => cipher.apply_keystream(data),
        }
    }

    /// Convenience copy-transform for callers that keep the input.
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}
