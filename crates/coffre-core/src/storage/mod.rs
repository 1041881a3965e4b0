pub mod fs_backend;
pub mod http_backend;
pub mod mock_backend;

use std::collections::BTreeMap;

use coffre_protocol::{ByteRange, ResourceKind};
use coffre_types::{CoffreError, Mac, Result};

/// A store configuration: string keys to string values, with at least a
/// `location` entry carrying the scheme-prefixed locator.
pub type StoreConfig = BTreeMap<String, String>;

/// Build a one-entry store config from a bare location string.
pub fn store_config_from_location(location: &str) -> StoreConfig {
    let mut cfg = StoreConfig::new();
    cfg.insert("location".to_string(), location.to_string());
    cfg
}

/// The narrow resource-oriented protocol every storage backend speaks.
///
/// Resources are content-addressed by MAC. `get` on a packfile may carry
/// a byte range; other kinds are always fetched whole.
pub trait Store: Send + Sync + std::fmt::Debug {
    fn location(&self) -> &str;

    /// Return the repository's wrapped configuration bytes.
    fn open(&self) -> Result<Vec<u8>>;

    /// Write the wrapped configuration of a new repository. Fails when
    /// one already exists at this location.
    fn create(&self, config: &[u8]) -> Result<()>;

    fn list(&self, kind: ResourceKind) -> Result<Vec<Mac>>;

    /// Read a blob, or a byte range of it. A range that reaches past the
    /// end of the blob is a storage error, not a short read.
    fn get(&self, kind: ResourceKind, mac: Mac, range: Option<ByteRange>) -> Result<Vec<u8>>;

    /// Returns the number of bytes written.
    fn put(&self, kind: ResourceKind, mac: Mac, data: &[u8]) -> Result<u64>;

    fn delete(&self, kind: ResourceKind, mac: Mac) -> Result<()>;

    /// Size in bytes of a stored blob.
    fn size(&self, kind: ResourceKind, mac: Mac) -> Result<u64> {
        Ok(self.get(kind, mac, None)?.len() as u64)
    }
}

/// Open the storage backend named by `store_config["location"]` and read
/// its wrapped configuration.
///
/// Supported locators:
/// - bare path or `fs://<path>` -> local filesystem
/// - `http://` / `https://`     -> remote storage server
/// - `mock://<name>`            -> in-process mock (shared per process)
/// - `sftp://`, `ptar:`         -> recognized, not compiled in
pub fn open_store(store_config: &StoreConfig) -> Result<(Box<dyn Store>, Vec<u8>)> {
    let store = backend_for(store_config)?;
    let serialized = store.open()?;
    Ok((store, serialized))
}

/// Build a backend without touching the repository configuration.
pub fn backend_for(store_config: &StoreConfig) -> Result<Box<dyn Store>> {
    let location = store_config
        .get("location")
        .ok_or_else(|| CoffreError::Config("store config is missing 'location'".into()))?;
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(CoffreError::Config("store location must not be empty".into()));
    }

    if let Some(path) = trimmed.strip_prefix("fs://") {
        return Ok(Box::new(fs_backend::FsStore::new(path)));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(Box::new(http_backend::HttpStore::new(trimmed)?));
    }
    if let Some(name) = trimmed.strip_prefix("mock://") {
        return Ok(Box::new(mock_backend::MockStore::shared(name)));
    }
    if trimmed == "mock" {
        return Ok(Box::new(mock_backend::MockStore::shared("default")));
    }
    if trimmed.starts_with("sftp://") {
        return Err(CoffreError::UnsupportedBackend(
            "sftp (not compiled in)".into(),
        ));
    }
    if trimmed.starts_with("ptar:") {
        return Err(CoffreError::UnsupportedBackend(
            "ptar (not compiled in)".into(),
        ));
    }

    // Bare paths are local too.
    if !trimmed.contains("://") {
        return Ok(Box::new(fs_backend::FsStore::new(trimmed)));
    }

    let scheme = trimmed.split("://").next().unwrap_or(trimmed);
    Err(CoffreError::UnsupportedBackend(scheme.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_is_local() {
        let cfg = store_config_from_location("/tmp/repo");
        assert!(backend_for(&cfg).is_ok());
    }

    #[test]
    fn fs_scheme_is_local() {
        let cfg = store_config_from_location("fs:///tmp/repo");
        let store = backend_for(&cfg).unwrap();
        assert_eq!(store.location(), "/tmp/repo");
    }

    #[test]
    fn sftp_not_compiled_in() {
        let cfg = store_config_from_location("sftp://host/path");
        match backend_for(&cfg) {
            Err(CoffreError::UnsupportedBackend(s)) => assert!(s.contains("sftp")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_scheme_rejected() {
        let cfg = store_config_from_location("ftp://host/path");
        assert!(matches!(
            backend_for(&cfg),
            Err(CoffreError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn missing_location_rejected() {
        let cfg = StoreConfig::new();
        assert!(matches!(backend_for(&cfg), Err(CoffreError::Config(_))));
    }
}
