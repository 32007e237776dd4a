//! Hash-based payment proofs
//!
//! This crate attests that a payment happened without exposing the
//! payment's transaction hash. It is a commitment scheme built on SHA-256,
//! not a succinct zero-knowledge argument: the verifier is the same service
//! that holds the prover's witness.
//!
//! ## Components
//!
//! ```text
//! zk/
//!  ├─ commitment.rs   # Commitment = H(tx, amount, nonce, timestamp)
//!  ├─ nullifier.rs    # Nullifier = H(tx, secret, nonce) + double-spend set
//!  ├─ merkle.rs       # Append-only accumulator with sibling paths
//!  ├─ range.rs        # min <= amount <= max assertion
//!  ├─ proof.rs        # ProofService: build, sign, verify
//!  └─ disclosure.rs   # Public view and aggregate analytics
//! ```
//!
//! ## Proof Construction
//!
//! ```text
//! commitment = H("commitment" : tx : amount : nonce : timestamp)
//! nullifier  = H("nullifier" : tx : secret : nonce)
//! leaf       = H("leaf" : commitment)
//! response   = H("response" : commitment : challenge : expectedAmount : nullifier)
//! signature  = ECDSA-P256(canonical JSON of the public fields)
//! ```
//!
//! ## Known Limitations
//!
//! - The range proof embeds `H("amount:" + amount)`. Payment amounts come
//!   from a small space, so a dictionary over plausible amounts recovers
//!   the value.
//! - Full verification needs the service's nullifier set and the
//!   witness-side hashes. A third party can check the signature against
//!   the published public key and the Merkle path, nothing more.

pub mod commitment;
pub mod disclosure;
pub mod merkle;
pub mod nullifier;
pub mod proof;
pub mod range;

// Re-export commonly used types
pub use commitment::Commitment;
pub use disclosure::{aggregate_proofs, selective_disclosure, ProofAggregate, PublicProof};
pub use merkle::{MerkleProof, MerkleTree, PathElement, Side};
pub use nullifier::{Nullifier, NullifierEntry, NullifierSet};
pub use proof::{
    ProofConfig, ProofFeatures, ProofOptions, ProofService, ServiceState, Witness, ZkProof,
};
pub use range::RangeProof;

/// Proof error types
#[derive(Debug, thiserror::Error)]
pub enum ZkError {
    #[error("Double-spend detected: nullifier {0} already used")]
    DoubleSpend(String),

    #[error("Malformed proof: {0}")]
    Malformed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Signing key error: {0}")]
    Signing(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ZkResult<T> = Result<T, ZkError>;

/// Canonical decimal rendering of an amount inside hashed fields.
///
/// Rust's shortest round-trip formatting, so `1.0` renders as `1` and the
/// same `f64` always yields the same string.
pub(crate) fn amount_str(amount: f64) -> String {
    format!("{}", amount)
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
