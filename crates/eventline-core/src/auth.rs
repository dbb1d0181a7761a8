//! Shared-secret digests for the authentication handshake
//!
//! Both roles hash the configured secret before it ever touches the wire;
//! the broker compares digests, and the digest value parameterizes the
//! `Authorized:`/`RemoveFromPending:` channel names.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Secret Digest
// ----------------------------------------------------------------------------

/// Hex SHA-256 digest of the shared secret key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretDigest(String);

impl SecretDigest {
    /// Derive the digest from a plaintext secret
    pub fn derive(secret: &str) -> Self {
        Self(hex::encode(Sha256::digest(secret.as_bytes())))
    }

    /// Wrap a digest received over the wire
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check a presented digest against this one
    pub fn matches(&self, presented: &str) -> bool {
        self.0 == presented
    }
}

impl fmt::Display for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
