//! Filesystem-based signing seed storage

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::keys::ServiceKeypair;

/// File name of the hex-encoded signing seed
pub const SEED_FILE_NAME: &str = "signing.seed";

/// Default directory for oracle state
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zkoracle")
}

/// Default location of the signing seed
pub fn default_seed_path() -> PathBuf {
    default_data_dir().join(SEED_FILE_NAME)
}

/// Load the signing keypair from a hex seed file
pub fn load_keypair(path: Option<&Path>) -> Result<ServiceKeypair> {
    let seed_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_seed_path);

    if !seed_path.exists() {
        anyhow::bail!(
            "Signing seed not found. Please run 'zkoracle keygen' first.\nLooked in: {}",
            seed_path.display()
        );
    }

    let content = fs::read_to_string(&seed_path).context("failed to read seed file")?;
    let seed = seed_from_hex(&content)?;
    ServiceKeypair::from_seed(seed)
}

/// Save the keypair seed as hex
pub fn save_keypair(keypair: &ServiceKeypair, path: Option<&Path>) -> Result<PathBuf> {
    let seed_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_seed_path);

    if let Some(dir) = seed_path.parent() {
        fs::create_dir_all(dir).context("failed to create seed directory")?;
    }

    fs::write(&seed_path, hex::encode(keypair.seed())).context("failed to write seed file")?;

    Ok(seed_path)
}

/// Load the keypair if a seed exists, otherwise generate an ephemeral one.
///
/// Returns `true` as the second element when the key was loaded from disk.
pub fn load_or_ephemeral(path: Option<&Path>) -> Result<(ServiceKeypair, bool)> {
    let seed_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_seed_path);

    if seed_path.exists() {
        Ok((load_keypair(Some(&seed_path))?, true))
    } else {
        Ok((ServiceKeypair::generate()?, false))
    }
}

/// Parse hex-encoded seed
fn seed_from_hex(hex: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex.trim()).context("invalid hex encoding")?;

    if bytes.len() != 32 {
        anyhow::bail!("seed must be 32 bytes");
    }

    let mut seed = [0u8; 32];
    seed.copy_from_slice(&bytes);
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_hex_seed_roundtrip() {
        let seed = [42u8; 32];
        let hex = hex::encode(seed);
        let decoded = seed_from_hex(&hex).unwrap();
        assert_eq!(seed, decoded);

        assert!(seed_from_hex("00ff").is_err());
        assert!(seed_from_hex("not hex").is_err());
    }

    #[test]
    fn test_save_and_load_keypair() {
        let temp_dir = env::temp_dir().join(format!("zkoracle_seed_{}", rand::random::<u32>()));
        let seed_path = temp_dir.join(SEED_FILE_NAME);

        let keypair = ServiceKeypair::generate().unwrap();
        let written = save_keypair(&keypair, Some(&seed_path)).unwrap();
        assert_eq!(written, seed_path);

        let loaded = load_keypair(Some(&seed_path)).unwrap();
        assert_eq!(keypair.public_key_hex(), loaded.public_key_hex());

        let (again, from_disk) = load_or_ephemeral(Some(&seed_path)).unwrap();
        assert!(from_disk);
        assert_eq!(again.public_key_hex(), keypair.public_key_hex());

        // Cleanup
        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_missing_seed() {
        let missing = env::temp_dir().join("zkoracle_missing_dir/none.seed");
        assert!(load_keypair(Some(&missing)).is_err());

        let (_, from_disk) = load_or_ephemeral(Some(&missing)).unwrap();
        assert!(!from_disk);
    }
}
