use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use coffre_types::{CoffreError, Mac, Result};

/// KDF parameters embedded in the repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    #[serde(with = "serde_bytes")]
    pub salt: Vec<u8>,
}

/// The encryption section of a repository configuration: how to derive
/// the key, and a canary to verify a derived key against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionBlock {
    pub kdf: KdfParams,
    #[serde(with = "serde_bytes")]
    pub canary: Vec<u8>,
}

// KDF parameter bounds to reject maliciously crafted configurations.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

const CANARY_TAG: &[u8] = b"coffre key canary v1";

fn validate_kdf_params(kdf: &KdfParams) -> Result<()> {
    if kdf.algorithm != "argon2id" {
        return Err(CoffreError::KeyDerivation(format!(
            "unsupported KDF algorithm '{}'",
            kdf.algorithm
        )));
    }
    if kdf.time_cost == 0 || kdf.time_cost > MAX_TIME_COST {
        return Err(CoffreError::KeyDerivation("time_cost out of bounds".into()));
    }
    if kdf.parallelism == 0 || kdf.parallelism > MAX_PARALLELISM {
        return Err(CoffreError::KeyDerivation("parallelism out of bounds".into()));
    }
    if kdf.memory_cost == 0 || kdf.memory_cost > MAX_MEMORY_KIB {
        return Err(CoffreError::KeyDerivation("memory_cost out of bounds".into()));
    }
    if kdf.salt.len() < MIN_SALT_LEN || kdf.salt.len() > MAX_SALT_LEN {
        return Err(CoffreError::KeyDerivation("salt length out of bounds".into()));
    }
    Ok(())
}

/// Derive a 32-byte repository key from a passphrase with argon2id.
pub fn derive_key(kdf: &KdfParams, passphrase: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    validate_kdf_params(kdf)?;

    let params = Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CoffreError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase, &kdf.salt, out.as_mut())
        .map_err(|e| CoffreError::KeyDerivation(format!("argon2: {e}")))?;
    Ok(out)
}

/// Check a derived key against the configuration's canary.
pub fn verify_canary(block: &EncryptionBlock, key: &[u8; 32]) -> bool {
    let expected = Mac::compute(key, CANARY_TAG);
    // The canary is public data; plain comparison leaks nothing useful.
    block.canary == expected.as_ref()
}

/// Build a fresh encryption block for a new repository: random salt,
/// moderate argon2id parameters, canary bound to the derived key.
pub fn new_encryption_block(passphrase: &[u8]) -> Result<EncryptionBlock> {
    let mut salt = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let kdf = KdfParams {
        algorithm: "argon2id".to_string(),
        time_cost: 3,
        memory_cost: 65_536, // 64 MiB
        parallelism: 4,
        salt,
    };
    let key = derive_key(&kdf, passphrase)?;
    let canary = Mac::compute(&key, CANARY_TAG).as_ref().to_vec();

    Ok(EncryptionBlock { kdf, canary })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kdf() -> KdfParams {
        KdfParams {
            algorithm: "argon2id".into(),
            time_cost: 1,
            memory_cost: 8,
            parallelism: 1,
            salt: vec![0x55; 16],
        }
    }

    #[test]
    fn derive_is_deterministic() {
        let kdf = test_kdf();
        let a = derive_key(&kdf, b"passphrase").unwrap();
        let b = derive_key(&kdf, b"passphrase").unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn different_passphrases_differ() {
        let kdf = test_kdf();
        let a = derive_key(&kdf, b"one").unwrap();
        let b = derive_key(&kdf, b"two").unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn canary_verifies_right_key_only() {
        let block = new_encryption_block(b"secret").unwrap();
        let good = derive_key(&block.kdf, b"secret").unwrap();
        let bad = derive_key(&block.kdf, b"wrong").unwrap();
        assert!(verify_canary(&block, &good));
        assert!(!verify_canary(&block, &bad));
    }

    #[test]
    fn kdf_bounds_enforced() {
        let mut kdf = test_kdf();
        kdf.time_cost = 0;
        assert!(derive_key(&kdf, b"x").is_err());

        let mut kdf = test_kdf();
        kdf.salt = vec![0; 4];
        assert!(derive_key(&kdf, b"x").is_err());

        let mut kdf = test_kdf();
        kdf.algorithm = "scrypt".into();
        assert!(derive_key(&kdf, b"x").is_err());
    }
}
