//! Append-only Merkle Accumulator
//!
//! Every accepted commitment becomes a leaf:
//!
//! ```text
//! leaf   = SHA256("leaf" : commitment_hex)
//! parent = SHA256(left || right)
//! ```
//!
//! A level with an odd node count pairs its last node with itself. The root
//! depends on insertion order. With a single leaf the root is that leaf.
//!
//! The tree keeps one hash array per level. Appending a leaf rehashes only
//! the path from that leaf to the root, so an insert costs O(log N).

use crypto::{hash_fields, hash_pair, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::commitment::Commitment;

/// Which side of the running hash a sibling sits on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathElement {
    pub sibling: Digest,
    pub side: Side,
}

/// Inclusion proof for a single leaf
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf_hash: Digest,
    pub root: Digest,
    pub leaf_index: usize,
    pub path: Vec<PathElement>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and its sibling path
    pub fn verify(&self) -> bool {
        verify_path(&self.leaf_hash, &self.path, &self.root)
    }
}

/// Leaf hash for a commitment
pub fn leaf_hash(commitment: &Commitment) -> Digest {
    hash_fields("leaf", &[&commitment.to_hex()])
}

/// Walk a sibling path from `leaf` and compare with `root`
pub fn verify_path(leaf: &Digest, path: &[PathElement], root: &Digest) -> bool {
    let computed = path.iter().fold(*leaf, |current, step| match step.side {
        Side::Right => hash_pair(&current, &step.sibling),
        Side::Left => hash_pair(&step.sibling, &current),
    });
    computed == *root
}

/// Root of a leaf list, recomputed from scratch level by level
pub fn compute_root(leaves: &[Digest]) -> Option<Digest> {
    if leaves.is_empty() {
        return None;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level.first().copied()
}

/// Incremental Merkle tree over commitment leaves
#[derive(Clone, Debug, Default)]
pub struct MerkleTree {
    /// levels[0] holds the leaves, the last level holds the root
    levels: Vec<Vec<Digest>>,
    /// Leaf hash -> first index it was inserted at
    index: HashMap<Digest, usize>,
}

impl MerkleTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from persisted leaf hashes
    pub fn from_leaves(leaves: impl IntoIterator<Item = Digest>) -> Self {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.push_leaf(leaf);
        }
        tree
    }

    /// Absorb a commitment, returning its leaf hash
    pub fn add_leaf(&mut self, commitment: &Commitment) -> Digest {
        let leaf = leaf_hash(commitment);
        self.push_leaf(leaf);
        leaf
    }

    fn push_leaf(&mut self, leaf: Digest) {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }

        let mut position = self.levels[0].len();
        self.levels[0].push(leaf);
        self.index.entry(leaf).or_insert(position);

        // Rehash the new leaf's ancestors only
        let mut depth = 0;
        while self.levels[depth].len() > 1 {
            let level = &self.levels[depth];
            let left_index = position & !1;
            let left = level[left_index];
            let right = level.get(left_index + 1).copied().unwrap_or(left);
            let parent = hash_pair(&left, &right);

            let parent_index = position / 2;
            if self.levels.len() == depth + 1 {
                self.levels.push(Vec::new());
            }
            let parents = &mut self.levels[depth + 1];
            if parent_index < parents.len() {
                parents[parent_index] = parent;
            } else {
                parents.push(parent);
            }

            position = parent_index;
            depth += 1;
        }
    }

    /// Current root, `None` while empty
    pub fn root(&self) -> Option<Digest> {
        self.levels.last().and_then(|top| top.first()).copied()
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Check if the tree has no leaves
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All leaf hashes in insertion order
    pub fn leaves(&self) -> &[Digest] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Build an inclusion proof for a commitment
    pub fn generate_proof(&self, commitment: &Commitment) -> Option<MerkleProof> {
        let leaf = leaf_hash(commitment);
        let leaf_index = *self.index.get(&leaf)?;
        let root = self.root()?;

        let mut path = Vec::new();
        let mut position = leaf_index;
        for level in self.levels.iter().take_while(|level| level.len() > 1) {
            let sibling_index = position ^ 1;
            let sibling = level.get(sibling_index).copied().unwrap_or(level[position]);
            let side = if position % 2 == 0 { Side::Right } else { Side::Left };
            path.push(PathElement { sibling, side });
            position /= 2;
        }

        Some(MerkleProof {
            leaf_hash: leaf,
            root,
            leaf_index,
            path,
        })
    }
}
