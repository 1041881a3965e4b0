pub mod key;

pub use key::{derive_key, new_encryption_block, verify_canary, EncryptionBlock, KdfParams};
