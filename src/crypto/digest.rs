//! Running message digest
//!
//! Relay-cell integrity uses a cumulative hash per direction per hop. A
//! cell's digest must be computed and checked before the cell is committed
//! to the running state, so finalization always happens on a clone of the
//! internal state. SHA-1 is the relay digest of the implemented link
//! version; SHA-256 covers the wider hop types.

use sha2::{Digest, Sha256};

/// SHA-1 digest size.
pub const TOR_DIGEST_LEN: usize = 20;

/// SHA-256 digest size.
pub const TOR_DIGEST256_LEN: usize = 32;

#[derive(Clone)]
enum DigestKind {
    Sha1(sha1::Sha1),
    Sha256(Sha256),
}

/// Incremental hash whose state can be inspected without being consumed.
#[derive(Clone)]
pub struct TorMessageDigest {
    inner: DigestKind,
}

impl TorMessageDigest {
    /// SHA-1 running digest (relay-cell default).
    pub fn new() -> Self {
        Self {
            inner: DigestKind::Sha1(sha1::Sha1::new()),
        }
    }

    /// SHA-256 running digest.
    pub fn new_sha256() -> Self {
        Self {
            inner: DigestKind::Sha256(Sha256::new()),
        }
    }

    pub fn hash_len(&self) -> usize {
        match self.inner {
            DigestKind::Sha1(_) => TOR_DIGEST_LEN,
            DigestKind::Sha256(_) => TOR_DIGEST256_LEN,
        }
    }

    /// Commit `data` to the running state.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            DigestKind::Sha1(hasher) => hasher.update(data),
            DigestKind::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Digest of everything committed so far. Finalizes a clone; the
    /// running state is untouched.
    pub fn current_digest(&self) -> Vec<u8> {
        match &self.inner {
            DigestKind::Sha1(hasher) => hasher.clone().finalize().to_vec(),
            DigestKind::Sha256(hasher) => hasher.clone().finalize().to_vec(),
        }
    }

    /// Digest as if `extra` were committed, without committing it.
    pub fn peek_digest(&self, extra: &[u8]) -> Vec<u8> {
        match &self.inner {
            DigestKind::Sha1(hasher) => {
                let mut clone = hasher.clone();
                clone.update(extra);
                clone.finalize().to_vec()
            }
            DigestKind::Sha256(hasher) => {
                let mut clone = hasher.clone();
                clone.update(extra);
                clone.finalize().to_vec()
            }
        }
    }
}

impl Default for TorMessageDigest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn running_digest_over_chained_blocks() {
        let mut digest = TorMessageDigest::new();

        let steps = [
            (
                "6bc1bee22e409f96e93d7e117393172a",
                "2137b53fef34d0d31ec388c3966ede215f50d07b",
            ),
            (
                "ae2d8a571e03ac9c9eb76fac45af8e51",
                "0613af950acadbb268fb9b7d1b58f3ec5ca57101",
            ),
            (
                "30c81c46a35ce411e5fbc1191a0a52ef",
                "c683bfa46b8d3688481ea36e8f11453a4aefe71c",
            ),
            (
                "f69f2445df4f9b17ad2b417be66c3710",
                "e0106285e6ff2dfad052be9491247bca7133d540",
            ),
        ];

        for (block, expected) in steps {
            digest.update(&unhex(block));
            assert_eq!(digest.current_digest(), unhex(expected));
        }
    }

    #[test]
    fn update_matches_one_shot_hash() {
        let mut digest = TorMessageDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");

        let direct = sha1::Sha1::digest(b"hello world").to_vec();
        assert_eq!(digest.current_digest(), direct);
    }

    #[test]
    fn peek_does_not_mutate_state() {
        let mut digest = TorMessageDigest::new();
        digest.update(b"committed");
        let before = digest.current_digest();

        let peeked = digest.peek_digest(b" and more");
        let direct = sha1::Sha1::digest(b"committed and more").to_vec();
        assert_eq!(peeked, direct);

        // Running state must be unchanged by the peek.
        assert_eq!(digest.current_digest(), before);

        // And committing the peeked bytes must reproduce the peek.
        digest.update(b" and more");
        assert_eq!(digest.current_digest(), peeked);
    }

    #[test]
    fn current_digest_does_not_consume() {
        let mut digest = TorMessageDigest::new();
        digest.update(b"abc");
        let first = digest.current_digest();
        let second = digest.current_digest();
        assert_eq!(first, second);
    }

    #[test]
    fn sha256_variant_sizes() {
        let digest = TorMessageDigest::new_sha256();
        assert_eq!(digest.hash_len(), TOR_DIGEST256_LEN);
        assert_eq!(digest.current_digest().len(), TOR_DIGEST256_LEN);

        let sha1 = TorMessageDigest::new();
        assert_eq!(sha1.hash_len(), TOR_DIGEST_LEN);
    }
}
