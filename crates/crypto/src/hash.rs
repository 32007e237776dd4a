//! SHA-256 hashing helpers
//!
//! Every commitment, nullifier, Merkle node and range commitment in the
//! oracle is a [`Digest`]. Field-based hashes join their inputs with `:`
//! behind a domain tag:
//!
//! ```text
//! hash_fields("commitment", [tx, amount, nonce, ts])
//!   = SHA256("commitment:" || tx || ":" || amount || ":" || nonce || ":" || ts)
//! ```

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest as _, Sha256};

/// A 32-byte SHA-256 output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 chars)
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Decode from a 64-char hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).context("invalid hex")?;
        if bytes.len() != 32 {
            anyhow::bail!("digest must be 32 bytes, got {}", bytes.len());
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of raw bytes
pub fn sha256(data: &[u8]) -> Digest {
    let hash = Sha256::digest(data);
    Digest(hash.into())
}

/// SHA-256 of a UTF-8 string
pub fn hash_str(s: &str) -> Digest {
    sha256(s.as_bytes())
}

/// Hash a domain tag and its fields, `:`-joined
pub fn hash_fields(tag: &str, fields: &[&str]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for field in fields {
        hasher.update(b":");
        hasher.update(field.as_bytes());
    }
    Digest(hasher.finalize().into())
}

/// Hash two nodes together (order matters)
pub fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest(hasher.finalize().into())
}

/// Hex string of `len` bytes from the OS RNG
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
