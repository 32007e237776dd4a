//! Range assertion over a payment amount
//!
//! ```text
//! amountHash      = H("amount:" + amount)
//! minHash         = H("min:" + min)
//! maxHash         = H("max:" + max)
//! rangeCommitment = H(amountHash || minHash || maxHash)
//! verified        = min <= amount <= max
//! ```
//!
//! `verified` comes from a direct comparison at creation time. The
//! commitment lets a verifier confirm which bounds were checked, but
//! `amountHash` is not hiding: amounts are few and guessable, so hashing
//! candidates recovers the value.

use crypto::{hash_str, Digest};
use serde::{Deserialize, Serialize};

use crate::amount_str;

/// Commitment-based assertion that `min <= amount <= max`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeProof {
    pub amount_hash: Digest,
    pub min_hash: Digest,
    pub max_hash: Digest,
    pub range_commitment: Digest,
    pub verified: bool,
}

impl RangeProof {
    /// Generate a range proof for an amount
    pub fn generate(amount: f64, min: f64, max: f64) -> Self {
        let amount_hash = hash_str(&format!("amount:{}", amount_str(amount)));
        let min_hash = bound_hash("min", min);
        let max_hash = bound_hash("max", max);
        let range_commitment = range_commitment(&amount_hash, &min_hash, &max_hash);

        Self {
            amount_hash,
            min_hash,
            max_hash,
            range_commitment,
            verified: amount >= min && amount <= max,
        }
    }

    /// Check the proof against the bounds the verifier expects
    pub fn verify(&self, expected_min: f64, expected_max: f64) -> bool {
        let expected = range_commitment(
            &self.amount_hash,
            &bound_hash("min", expected_min),
            &bound_hash("max", expected_max),
        );
        expected == self.range_commitment && self.verified
    }
}

fn bound_hash(label: &str, bound: f64) -> Digest {
    hash_str(&format!("{}:{}", label, amount_str(bound)))
}

fn range_commitment(amount_hash: &Digest, min_hash: &Digest, max_hash: &Digest) -> Digest {
    hash_str(&format!(
        "{}{}{}",
        amount_hash.to_hex(),
        min_hash.to_hex(),
        max_hash.to_hex()
    ))
}
