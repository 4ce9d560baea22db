//! Cumulative SHA-256 hash chain.
//!
//! Every frame carries the digest of everything sent so far:
//!
//! ```text
//! h₁ = SHA256(payload₁)
//! hₙ = SHA256(hₙ₋₁ ∥ payloadₙ)
//! ```
//!
//! Loss, duplication or reordering of any frame therefore shows up as a
//! mismatch on the next link, without hashing the whole file at once.

use sha2::{Digest, Sha256};

use crate::error::TunnelError;

/// Length of a raw SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Running state of a hash chain.
#[derive(Debug, Clone, Default)]
pub struct HashChain {
    previous: Option<[u8; DIGEST_LEN]>,
}

impl HashChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last link, or `None` before the first update.
    pub fn previous(&self) -> Option<&[u8; DIGEST_LEN]> {
        self.previous.as_ref()
    }

    /// Advance the chain over `payload` and return the new link.
    pub fn update(&mut self, payload: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        if let Some(prev) = &self.previous {
            hasher.update(prev);
        }
        hasher.update(payload);
        let mut next = [0u8; DIGEST_LEN];
        next.copy_from_slice(&hasher.finalize());
        self.previous = Some(next);
        next
    }

    /// Advance the chain and return the new link as lower-case hex,
    /// truncated to `hex_len` characters.
    pub fn next_hex(&mut self, payload: &[u8], hex_len: usize) -> String {
        let mut digest = hex::encode(self.update(payload));
        digest.truncate(hex_len);
        digest
    }

    /// Advance the chain over `payload` and compare against the digest the
    /// peer embedded in the frame.
    ///
    /// The comparison covers exactly `embedded.len()` hex characters, so
    /// truncated upload digests and full download digests share the path.
    pub fn verify(&mut self, payload: &[u8], embedded: &str) -> Result<(), TunnelError> {
        let actual = self.next_hex(payload, embedded.len());
        if actual.eq_ignore_ascii_case(embedded) {
            Ok(())
        } else {
            Err(TunnelError::Integrity {
                expected: embedded.to_string(),
                actual,
            })
        }
    }
}
