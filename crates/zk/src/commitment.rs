//! Payment Commitments
//!
//! A commitment binds a payment to a random nonce and a timestamp:
//!
//! ```text
//! C = SHA256("commitment" : tx_hash : amount : nonce : timestamp)
//! ```
//!
//! Properties:
//! - Deterministic: the same four inputs always give the same C
//! - Opaque: C does not reveal the amount or the transaction hash without
//!   the witness (nonce included)
//! - Disjoint from the nullifier, which hashes a different field set

use crypto::{hash_fields, Digest};
use serde::{Deserialize, Serialize};

use crate::amount_str;

/// Commitment to a payment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitment(pub Digest);

impl Commitment {
    /// Create a commitment to a payment
    pub fn create(transaction_hash: &str, amount: f64, nonce: &str, timestamp: i64) -> Self {
        Self(hash_fields(
            "commitment",
            &[
                transaction_hash,
                &amount_str(amount),
                nonce,
                &timestamp.to_string(),
            ],
        ))
    }

    /// Verify a commitment opening
    pub fn verify_opening(
        &self,
        transaction_hash: &str,
        amount: f64,
        nonce: &str,
        timestamp: i64,
    ) -> bool {
        *self == Self::create(transaction_hash, amount, nonce, timestamp)
    }

    /// Underlying digest
    pub fn digest(&self) -> &Digest {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Short hex representation (first 8 chars)
    pub fn short_hex(&self) -> String {
        self.0.short_hex()
    }
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TX: &str = "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW";

    #[test]
    fn test_commitment_determinism() {
        let c1 = Commitment::create(TX, 1.5, "nonce-a", 1_700_000_000_000);
        let c2 = Commitment::create(TX, 1.5, "nonce-a", 1_700_000_000_000);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_commitment_binding() {
        let base = Commitment::create(TX, 1.5, "nonce-a", 1_700_000_000_000);

        assert_ne!(base, Commitment::create(TX, 1.51, "nonce-a", 1_700_000_000_000));
        assert_ne!(base, Commitment::create(TX, 1.5, "nonce-b", 1_700_000_000_000));
        assert_ne!(base, Commitment::create(TX, 1.5, "nonce-a", 1_700_000_000_001));
        assert_ne!(base, Commitment::create("other", 1.5, "nonce-a", 1_700_000_000_000));
    }

    #[test]
    fn test_verify_opening() {
        let commitment = Commitment::create(TX, 2.0, "n", 42);

        assert!(commitment.verify_opening(TX, 2.0, "n", 42));
        assert!(!commitment.verify_opening(TX, 2.5, "n", 42));
        assert!(!commitment.verify_opening(TX, 2.0, "m", 42));
    }

    #[test]
    fn test_commitment_hides_inputs() {
        let commitment = Commitment::create(TX, 2.0, "n", 42);
        let hex = commitment.to_hex();

        assert_eq!(hex.len(), 64);
        assert!(!hex.contains(TX));
    }
}
