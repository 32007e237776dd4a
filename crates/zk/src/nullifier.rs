//! Nullifier System for Double-Spend Prevention
//!
//! A nullifier is computed as:
//! N = SHA256("nullifier" : tx_hash : secret : nonce)
//!
//! Properties:
//! - Each payment proof carries exactly one nullifier
//! - Nullifiers reveal nothing about the commitment
//! - Cannot compute nullifier without the secret
//!
//! The [`NullifierSet`] records which proof claimed each nullifier. A
//! nullifier moves from ABSENT to USED once and never back.

use crypto::{hash_fields, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A nullifier that prevents double-spending
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nullifier(pub Digest);

impl Nullifier {
    /// Compute nullifier from the payment's transaction hash, secret and nonce
    pub fn generate(transaction_hash: &str, secret: &str, nonce: &str) -> Self {
        Self(hash_fields("nullifier", &[transaction_hash, secret, nonce]))
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

impl std::fmt::Display for Nullifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A used nullifier and the proof that claimed it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NullifierEntry {
    pub nullifier: Nullifier,
    pub proof_id: String,
}

/// Registry of used nullifiers
#[derive(Default)]
pub struct NullifierSet {
    /// Used nullifiers mapped to the id of the proof that claimed them
    used: RwLock<HashMap<Nullifier, String>>,
}

impl NullifierSet {
    /// Create a new empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a nullifier has been used
    pub async fn is_used(&self, nullifier: &Nullifier) -> bool {
        self.used.read().await.contains_key(nullifier)
    }

    /// Proof id that claimed a nullifier, if any
    pub async fn owner(&self, nullifier: &Nullifier) -> Option<String> {
        self.used.read().await.get(nullifier).cloned()
    }

    /// Mark a nullifier as used. Keeps the first owner if already present.
    pub async fn mark_used(&self, nullifier: Nullifier, proof_id: &str) {
        self.used
            .write()
            .await
            .entry(nullifier)
            .or_insert_with(|| proof_id.to_string());
    }

    /// Atomically claim a nullifier for a proof.
    ///
    /// Check and insert happen under one write lock. Claiming again with the
    /// same proof id succeeds; a different owner is returned as the error.
    pub async fn claim(&self, nullifier: Nullifier, proof_id: &str) -> Result<(), String> {
        let mut used = self.used.write().await;
        match used.get(&nullifier) {
            Some(owner) if owner == proof_id => Ok(()),
            Some(owner) => Err(owner.clone()),
            None => {
                used.insert(nullifier, proof_id.to_string());
                Ok(())
            }
        }
    }

    /// Get number of used nullifiers
    pub async fn len(&self) -> usize {
        self.used.read().await.len()
    }

    /// Check if set is empty
    pub async fn is_empty(&self) -> bool {
        self.used.read().await.is_empty()
    }

    /// Copy of every used nullifier, for persistence
    pub async fn snapshot(&self) -> Vec<NullifierEntry> {
        self.used
            .read()
            .await
            .iter()
            .map(|(nullifier, proof_id)| NullifierEntry {
                nullifier: *nullifier,
                proof_id: proof_id.clone(),
            })
            .collect()
    }

    /// Re-insert persisted nullifiers. Entries already present are kept.
    pub async fn restore(&self, entries: Vec<NullifierEntry>) {
        let mut used = self.used.write().await;
        for entry in entries {
            used.entry(entry.nullifier).or_insert(entry.proof_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_nullifier_computation() {
        let n1 = Nullifier::generate("tx", "secret", "nonce");
        let n2 = Nullifier::generate("tx", "secret", "nonce");

        // Same inputs should give same nullifier
        assert_eq!(n1, n2);
    }

    #[test]
    fn test_nullifier_uniqueness() {
        // Different nonces should give different nullifiers
        let n1 = Nullifier::generate("tx", "secret", "1");
        let n2 = Nullifier::generate("tx", "secret", "2");
        assert_ne!(n1, n2);

        // Different secrets too
        let n3 = Nullifier::generate("tx", "other", "1");
        assert_ne!(n1, n3);
    }

    #[tokio::test]
    async fn test_nullifier_set() {
        let set = NullifierSet::new();

        let n1 = Nullifier::generate("tx", "s", "1");
        let n2 = Nullifier::generate("tx", "s", "2");

        // First claim should succeed
        assert!(!set.is_used(&n1).await);
        assert!(set.claim(n1, "zkp_a").await.is_ok());
        assert!(set.is_used(&n1).await);

        // Same owner is idempotent
        assert!(set.claim(n1, "zkp_a").await.is_ok());

        // Double-spend should fail and report the first owner
        assert_eq!(set.claim(n1, "zkp_b").await, Err("zkp_a".to_string()));

        // mark_used keeps the original owner
        set.mark_used(n1, "zkp_c").await;
        assert_eq!(set.owner(&n1).await.as_deref(), Some("zkp_a"));

        // Different nullifier should work
        assert!(set.claim(n2, "zkp_b").await.is_ok());
        assert_eq!(set.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let set = Arc::new(NullifierSet::new());
        let nullifier = Nullifier::generate("tx", "s", "race");

        let mut handles = Vec::new();
        for i in 0..16 {
            let set = set.clone();
            handles.push(tokio::spawn(async move {
                set.claim(nullifier, &format!("zkp_{}", i)).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(set.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let set = NullifierSet::new();
        let n = Nullifier::generate("tx", "s", "1");
        set.claim(n, "zkp_a").await.unwrap();

        let restored = NullifierSet::new();
        restored.restore(set.snapshot().await).await;

        assert!(restored.is_used(&n).await);
        assert!(restored.claim(n, "zkp_other").await.is_err());
    }
}
