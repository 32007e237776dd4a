//! Payment Proof Generation and Verification
//!
//! [`ProofService`] owns the signing keypair, the nullifier set, the Merkle
//! accumulator and the table of issued proofs. One instance is built at
//! startup and shared by reference with everything that issues or checks
//! proofs.
//!
//! Nullifiers are claimed when a proof is generated. Verification accepts a
//! nullifier claimed by the proof being verified and rejects one claimed by
//! any other proof.

use crypto::{hash_fields, random_hex, Digest, ServiceKeypair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::commitment::Commitment;
use crate::merkle::{leaf_hash, MerkleProof, MerkleTree};
use crate::nullifier::{Nullifier, NullifierEntry, NullifierSet};
use crate::range::RangeProof;
use crate::{amount_str, now_millis, ZkError, ZkResult};

/// Proof service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofConfig {
    /// Symmetric tolerance of the range proof around the expected amount
    pub range_tolerance: f64,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            range_tolerance: 0.05, // ±5%
        }
    }
}

impl ProofConfig {
    /// Range-proof bounds for an expected amount
    pub fn bounds(&self, expected_amount: f64) -> (f64, f64) {
        (
            expected_amount * (1.0 - self.range_tolerance),
            expected_amount * (1.0 + self.range_tolerance),
        )
    }
}

/// Optional overrides for proof generation
#[derive(Clone, Debug, Default)]
pub struct ProofOptions {
    pub nonce: Option<String>,
    pub secret: Option<String>,
    pub challenge: Option<String>,
    pub timestamp: Option<i64>,
}

/// Which parts of the scheme a proof carries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofFeatures {
    pub commitment: bool,
    pub nullifier: bool,
    pub merkle_tree: bool,
    pub range_proof: bool,
    pub signature: bool,
    pub selective_disclosure: bool,
}

impl Default for ProofFeatures {
    fn default() -> Self {
        Self {
            commitment: true,
            nullifier: true,
            merkle_tree: true,
            range_proof: true,
            signature: true,
            selective_disclosure: true,
        }
    }
}

/// Private opening of a proof. Never leaves the service's trust boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Witness {
    pub transaction_hash: String,
    pub amount: f64,
    pub nonce: String,
    pub secret: String,
}

/// A signed payment proof
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZkProof {
    pub id: String,
    pub commitment: Commitment,
    pub challenge: String,
    pub response: Digest,
    pub nullifier: Nullifier,
    pub merkle_root: Digest,
    pub merkle_proof: MerkleProof,
    pub range_proof: RangeProof,
    /// Hex of the 64-byte ECDSA P-256 signature
    pub signature: String,
    pub expected_amount: f64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub verified: bool,
    pub features: ProofFeatures,
    #[serde(rename = "_witness", default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<Witness>,
}

/// Fields covered by the signature, in canonical order
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields<'a> {
    commitment: &'a Commitment,
    challenge: &'a str,
    response: &'a Digest,
    nullifier: &'a Nullifier,
    merkle_root: &'a Digest,
    range_commitment: &'a Digest,
    expected_amount: f64,
    timestamp: i64,
}

impl ZkProof {
    /// Canonical bytes the service signs
    pub fn signing_payload(&self) -> ZkResult<Vec<u8>> {
        let fields = SignedFields {
            commitment: &self.commitment,
            challenge: &self.challenge,
            response: &self.response,
            nullifier: &self.nullifier,
            merkle_root: &self.merkle_root,
            range_commitment: &self.range_proof.range_commitment,
            expected_amount: self.expected_amount,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    /// Amount from the witness, if this is the private form
    pub fn amount(&self) -> Option<f64> {
        self.witness.as_ref().map(|w| w.amount)
    }
}

/// Challenge response binding commitment, challenge, amount and nullifier
pub fn compute_response(
    commitment: &Commitment,
    challenge: &str,
    expected_amount: f64,
    nullifier: &Nullifier,
) -> Digest {
    hash_fields(
        "response",
        &[
            &commitment.to_hex(),
            challenge,
            &amount_str(expected_amount),
            &nullifier.to_hex(),
        ],
    )
}

/// Persistable double-spend state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub nullifiers: Vec<NullifierEntry>,
    pub leaves: Vec<Digest>,
}

/// Builds and verifies payment proofs
pub struct ProofService {
    keypair: ServiceKeypair,
    config: ProofConfig,
    nullifiers: NullifierSet,
    tree: RwLock<MerkleTree>,
    proofs: RwLock<HashMap<String, ZkProof>>,
}

impl ProofService {
    /// Create a service around an existing keypair
    pub fn new(keypair: ServiceKeypair, config: ProofConfig) -> Self {
        info!("Proof service ready (public key {})", keypair.public_key_hex());
        Self {
            keypair,
            config,
            nullifiers: NullifierSet::new(),
            tree: RwLock::new(MerkleTree::new()),
            proofs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a service with a freshly generated, in-memory keypair
    pub fn ephemeral(config: ProofConfig) -> ZkResult<Self> {
        let keypair = ServiceKeypair::generate().map_err(|e| ZkError::Signing(e.to_string()))?;
        Ok(Self::new(keypair, config))
    }

    /// Service configuration
    pub fn config(&self) -> &ProofConfig {
        &self.config
    }

    /// Compressed public key used for signatures
    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    /// Current accumulator root
    pub async fn merkle_root(&self) -> Option<Digest> {
        self.tree.read().await.root()
    }

    /// Number of issued proofs held in memory
    pub async fn proof_count(&self) -> usize {
        self.proofs.read().await.len()
    }

    /// Look up an issued proof
    pub async fn get_proof(&self, id: &str) -> Option<ZkProof> {
        self.proofs.read().await.get(id).cloned()
    }

    /// Check whether a nullifier has been used
    pub async fn is_nullifier_used(&self, nullifier: &Nullifier) -> bool {
        self.nullifiers.is_used(nullifier).await
    }

    /// Generate a signed proof that `amount` was paid in `transaction_hash`
    pub async fn generate_proof(
        &self,
        transaction_hash: &str,
        amount: f64,
        expected_amount: f64,
        options: ProofOptions,
    ) -> ZkResult<ZkProof> {
        if transaction_hash.trim().is_empty() {
            return Err(ZkError::InvalidInput("transaction hash is empty".into()));
        }
        if !amount.is_finite() || amount < 0.0 {
            return Err(ZkError::InvalidInput(format!("invalid amount {}", amount)));
        }
        if !expected_amount.is_finite() || expected_amount <= 0.0 {
            return Err(ZkError::InvalidInput(format!(
                "invalid expected amount {}",
                expected_amount
            )));
        }

        let id = format!("zkp_{}", random_hex(16));
        let nonce = options.nonce.unwrap_or_else(|| random_hex(32));
        let secret = options.secret.unwrap_or_else(|| random_hex(32));
        let timestamp = options.timestamp.unwrap_or_else(now_millis);

        let commitment = Commitment::create(transaction_hash, amount, &nonce, timestamp);
        let nullifier = Nullifier::generate(transaction_hash, &secret, &nonce);

        // Check and mark in one step
        if let Err(owner) = self.nullifiers.claim(nullifier, &id).await {
            warn!(
                "Double-spend attempt: nullifier {} already claimed by {}",
                nullifier.short_hex(),
                owner
            );
            return Err(ZkError::DoubleSpend(nullifier.to_hex()));
        }

        let (merkle_root, merkle_proof) = {
            let mut tree = self.tree.write().await;
            tree.add_leaf(&commitment);
            let proof = tree
                .generate_proof(&commitment)
                .ok_or_else(|| ZkError::Malformed("leaf missing after insert".into()))?;
            (proof.root, proof)
        };

        let (min, max) = self.config.bounds(expected_amount);
        let range_proof = RangeProof::generate(amount, min, max);

        let challenge = options.challenge.unwrap_or_else(|| random_hex(32));
        let response = compute_response(&commitment, &challenge, expected_amount, &nullifier);

        let mut proof = ZkProof {
            id,
            commitment,
            challenge,
            response,
            nullifier,
            merkle_root,
            merkle_proof,
            range_proof,
            signature: String::new(),
            expected_amount,
            timestamp,
            verified: false,
            features: ProofFeatures::default(),
            witness: Some(Witness {
                transaction_hash: transaction_hash.to_string(),
                amount,
                nonce,
                secret,
            }),
        };

        let payload = proof.signing_payload()?;
        proof.signature = hex::encode(self.keypair.sign(&payload));
        proof.verified = self.verify_proof(&proof).await?;

        info!(
            "Generated proof {} (commitment {}, verified: {})",
            proof.id,
            proof.commitment.short_hex(),
            proof.verified
        );

        self.proofs
            .write()
            .await
            .insert(proof.id.clone(), proof.clone());

        Ok(proof)
    }

    /// Verify a proof end to end.
    ///
    /// Returns `Ok(false)` for any failed check and `Err` only when the
    /// proof is structurally incomplete.
    pub async fn verify_proof(&self, proof: &ZkProof) -> ZkResult<bool> {
        if proof.id.trim().is_empty() {
            return Err(ZkError::Malformed("missing proof id".into()));
        }
        if proof.challenge.is_empty() {
            return Err(ZkError::Malformed("missing challenge".into()));
        }
        if proof.signature.is_empty() {
            return Err(ZkError::Malformed("missing signature".into()));
        }
        let signature = hex::decode(&proof.signature)
            .map_err(|e| ZkError::Malformed(format!("signature is not hex: {}", e)))?;

        if let Some(owner) = self.nullifiers.owner(&proof.nullifier).await {
            if owner != proof.id {
                debug!(
                    "Proof {} rejected: nullifier {} belongs to {}",
                    proof.id,
                    proof.nullifier.short_hex(),
                    owner
                );
                return Ok(false);
            }
        }

        let expected_response = compute_response(
            &proof.commitment,
            &proof.challenge,
            proof.expected_amount,
            &proof.nullifier,
        );
        if expected_response != proof.response {
            debug!("Proof {} rejected: response mismatch", proof.id);
            return Ok(false);
        }

        let merkle = &proof.merkle_proof;
        if merkle.leaf_hash != leaf_hash(&proof.commitment)
            || merkle.root != proof.merkle_root
            || !merkle.verify()
        {
            debug!("Proof {} rejected: Merkle path invalid", proof.id);
            return Ok(false);
        }

        // The tree keeps growing; an older root is expected
        if self.merkle_root().await != Some(proof.merkle_root) {
            warn!(
                "Proof {} anchors to root {} which is no longer current",
                proof.id,
                proof.merkle_root.short_hex()
            );
        }

        let (min, max) = self.config.bounds(proof.expected_amount);
        if !proof.range_proof.verify(min, max) {
            debug!("Proof {} rejected: range proof invalid", proof.id);
            return Ok(false);
        }

        let payload = proof.signing_payload()?;
        if !self.keypair.verify(&payload, &signature) {
            debug!("Proof {} rejected: bad signature", proof.id);
            return Ok(false);
        }

        if self.nullifiers.claim(proof.nullifier, &proof.id).await.is_err() {
            debug!("Proof {} lost nullifier race", proof.id);
            return Ok(false);
        }

        Ok(true)
    }

    /// Recompute commitment and nullifier from the private witness
    pub fn verify_witness(&self, proof: &ZkProof) -> bool {
        let Some(witness) = &proof.witness else {
            return false;
        };

        let commitment_ok = proof.commitment.verify_opening(
            &witness.transaction_hash,
            witness.amount,
            &witness.nonce,
            proof.timestamp,
        );
        let nullifier_ok = proof.nullifier
            == Nullifier::generate(&witness.transaction_hash, &witness.secret, &witness.nonce);

        commitment_ok && nullifier_ok
    }

    /// Export nullifiers and leaves so double-spend protection survives a restart
    pub async fn export_state(&self) -> ServiceState {
        ServiceState {
            nullifiers: self.nullifiers.snapshot().await,
            leaves: self.tree.read().await.leaves().to_vec(),
        }
    }

    /// Restore persisted state. Only valid on a service with no leaves yet.
    pub async fn import_state(&self, state: ServiceState) -> ZkResult<()> {
        let mut tree = self.tree.write().await;
        if !tree.is_empty() {
            return Err(ZkError::InvalidInput(
                "cannot import state into a non-empty accumulator".into(),
            ));
        }

        let nullifier_count = state.nullifiers.len();
        *tree = MerkleTree::from_leaves(state.leaves);
        self.nullifiers.restore(state.nullifiers).await;

        info!(
            "Restored {} nullifiers and {} leaves",
            nullifier_count,
            tree.len()
        );
        Ok(())
    }
}
