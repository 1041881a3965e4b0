use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coffre_types::{CoffreError, Mac, Result};

use crate::crypto::EncryptionBlock;

/// Storage format version understood by this binary.
pub const STORAGE_VERSION: u32 = 1;

/// Magic bytes at the start of a wrapped configuration.
pub const CONFIG_MAGIC: &[u8; 8] = b"COFFREv1";

// Fixed key binding the configuration checksum. The wrapping protects
// against corruption and accidental cross-format reads, not against a
// storage operator (who owns the bytes anyway).
const CONFIG_CHECKSUM_KEY: [u8; 32] = *b"coffre configuration checksum k0";

/// Packfile-format parameters, immutable for the repository lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackfileParams {
    pub max_size: u32,
}

impl Default for PackfileParams {
    fn default() -> Self {
        PackfileParams {
            max_size: 64 * 1024 * 1024,
        }
    }
}

/// The repository configuration: identity, encryption parameters and
/// packfile-format parameters. Serialized, wrapped and stored once at
/// repository creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub version: u32,
    pub repository_id: Uuid,
    pub created: DateTime<Utc>,
    pub encryption: Option<EncryptionBlock>,
    pub packfile: PackfileParams,
}

impl Configuration {
    pub fn new(encryption: Option<EncryptionBlock>) -> Self {
        Configuration {
            version: STORAGE_VERSION,
            repository_id: Uuid::new_v4(),
            created: Utc::now(),
            encryption,
            packfile: PackfileParams::default(),
        }
    }

    /// Serialize into the wrapped on-storage form:
    /// `magic || msgpack body || keyed-BLAKE2 checksum of the body`.
    pub fn wrap(&self) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self)?;
        let checksum = Mac::compute(&CONFIG_CHECKSUM_KEY, &body);
        let mut out = Vec::with_capacity(CONFIG_MAGIC.len() + body.len() + 32);
        out.extend_from_slice(CONFIG_MAGIC);
        out.extend_from_slice(&body);
        out.extend_from_slice(checksum.as_ref());
        Ok(out)
    }

    /// Parse and verify wrapped configuration bytes as returned by
    /// `Store::open`.
    pub fn from_wrapped_bytes(data: &[u8]) -> Result<Configuration> {
        if data.len() < CONFIG_MAGIC.len() + 32 {
            return Err(CoffreError::InvalidFormat(
                "configuration too short".into(),
            ));
        }
        if &data[..CONFIG_MAGIC.len()] != CONFIG_MAGIC {
            return Err(CoffreError::InvalidFormat(
                "bad configuration magic".into(),
            ));
        }

        let body = &data[CONFIG_MAGIC.len()..data.len() - 32];
        let checksum = &data[data.len() - 32..];
        let expected = Mac::compute(&CONFIG_CHECKSUM_KEY, body);
        if checksum != expected.as_ref() {
            return Err(CoffreError::InvalidFormat(
                "configuration checksum mismatch".into(),
            ));
        }

        let config: Configuration = rmp_serde::from_slice(body)?;
        if config.version != STORAGE_VERSION {
            return Err(CoffreError::UnsupportedVersion(config.version));
        }
        Ok(config)
    }
}
