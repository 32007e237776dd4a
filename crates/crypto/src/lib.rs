//! Hashing and signing primitives shared by the proof service and the oracle.

pub mod hash;
pub mod keys;
pub mod storage;

// Re-export main types
pub use hash::{hash_fields, hash_pair, hash_str, random_hex, sha256, Digest};
pub use keys::{verify_signature, verifying_key_from_hex, ServiceKeypair};
pub use storage::{default_data_dir, load_keypair, load_or_ephemeral, save_keypair};
