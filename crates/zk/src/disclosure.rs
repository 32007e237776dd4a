//! Selective disclosure and aggregate analytics
//!
//! A [`PublicProof`] is what leaves the service: the witness is stripped
//! and the transaction hash is never included. The amount is revealed only
//! on request.

use crypto::Digest;
use serde::{Deserialize, Serialize};

use crate::commitment::Commitment;
use crate::merkle::MerkleProof;
use crate::nullifier::Nullifier;
use crate::proof::{ProofFeatures, ZkProof};
use crate::range::RangeProof;

/// Proof view safe to hand to a payer or a third party
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProof {
    pub id: String,
    pub commitment: Commitment,
    pub challenge: String,
    pub response: Digest,
    pub nullifier: Nullifier,
    pub merkle_root: Digest,
    pub merkle_proof: MerkleProof,
    pub range_proof: RangeProof,
    pub signature: String,
    pub expected_amount: f64,
    pub timestamp: i64,
    pub verified: bool,
    pub features: ProofFeatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

/// Strip the witness, optionally revealing the paid amount
pub fn selective_disclosure(proof: &ZkProof, reveal_amount: bool) -> PublicProof {
    PublicProof {
        id: proof.id.clone(),
        commitment: proof.commitment,
        challenge: proof.challenge.clone(),
        response: proof.response,
        nullifier: proof.nullifier,
        merkle_root: proof.merkle_root,
        merkle_proof: proof.merkle_proof.clone(),
        range_proof: proof.range_proof.clone(),
        signature: proof.signature.clone(),
        expected_amount: proof.expected_amount,
        timestamp: proof.timestamp,
        verified: proof.verified,
        features: proof.features.clone(),
        amount: if reveal_amount { proof.amount() } else { None },
    }
}

/// Totals across many proofs, without per-payment transaction hashes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofAggregate {
    pub count: usize,
    pub total_expected_amount: f64,
    pub earliest_timestamp: Option<i64>,
    pub latest_timestamp: Option<i64>,
    pub nullifiers: Vec<Nullifier>,
    pub commitments: Vec<Commitment>,
}

/// Aggregate a batch of proofs
pub fn aggregate_proofs(proofs: &[ZkProof]) -> ProofAggregate {
    ProofAggregate {
        count: proofs.len(),
        total_expected_amount: proofs.iter().map(|p| p.expected_amount).sum(),
        earliest_timestamp: proofs.iter().map(|p| p.timestamp).min(),
        latest_timestamp: proofs.iter().map(|p| p.timestamp).max(),
        nullifiers: proofs.iter().map(|p| p.nullifier).collect(),
        commitments: proofs.iter().map(|p| p.commitment).collect(),
    }
}
