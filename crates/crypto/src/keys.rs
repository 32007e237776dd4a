//! Proof-service signing key
//!
//! The oracle signs every proof it issues with a single ECDSA P-256 key.
//! The key is derived from a 32-byte master seed:
//!
//! ```text
//! signing_scalar = HKDF-SHA256(ikm = seed, info = "zkoracle-proof-signing-v1")
//! ```
//!
//! Holding the seed is enough to re-verify proofs in a later process.

use anyhow::{Context, Result};
use hkdf::Hkdf;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

const SIGNING_KEY_INFO: &[u8] = b"zkoracle-proof-signing-v1";

/// ECDSA P-256 keypair owned by the proof service
#[derive(Clone)]
pub struct ServiceKeypair {
    /// Master seed (32 bytes)
    seed: [u8; 32],
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl ServiceKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Derive the keypair from a master seed
    pub fn from_seed(seed: [u8; 32]) -> Result<Self> {
        let scalar = derive_signing_scalar(&seed)?;
        let signing_key =
            SigningKey::from_slice(&scalar).context("derived scalar is not a valid P-256 key")?;
        let verifying_key = VerifyingKey::from(&signing_key);

        Ok(Self {
            seed,
            signing_key,
            verifying_key,
        })
    }

    /// Get the seed (for backup/export)
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Public key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Compressed SEC1 public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_encoded_point(true).as_bytes())
    }

    /// Sign a message, returning the 64-byte `r || s` signature
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.signing_key.sign(message);
        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        out
    }

    /// Verify a signature made by this keypair
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.verifying_key, message, signature).is_ok()
    }
}

impl std::fmt::Debug for ServiceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceKeypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

fn derive_signing_scalar(seed: &[u8; 32]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, seed);
    let mut okm = [0u8; 32];
    hk.expand(SIGNING_KEY_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
    Ok(okm)
}

/// Parse a compressed or uncompressed SEC1 public key from hex
pub fn verifying_key_from_hex(s: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(s.trim()).context("invalid hex")?;
    VerifyingKey::from_sec1_bytes(&bytes).context("invalid P-256 public key")
}

/// Verify an ECDSA P-256 signature given as raw `r || s` bytes
pub fn verify_signature(
    public_key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let sig = Signature::from_slice(signature).context("malformed signature")?;
    public_key
        .verify(message, &sig)
        .context("signature verification failed")
}
