//! Sender identities derived from network addresses.
//!
//! An identity is a salted SHA-256 of the client address. It exists only to
//! key rate-limiter state and to label log lines; it is never sent to other
//! clients and is not reversible. The salt is random per process, so
//! identities are not even comparable across restarts.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Per-process salt mixed into every identity hash.
#[derive(Debug, Clone, Copy)]
pub struct IdentitySalt([u8; 16]);

impl IdentitySalt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Fixed salt for tests that need stable identities.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

/// Opaque, non-reversible hash of a sender's network address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderIdentity([u8; 32]);

impl SenderIdentity {
    /// Derive the identity for a client address (an IP in string form).
    pub fn derive(salt: &IdentitySalt, address: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.0);
        hasher.update(address.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for SenderIdentity {
    /// Abbreviated hex, for log lines only.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SenderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SenderIdentity({self})")
    }
}
