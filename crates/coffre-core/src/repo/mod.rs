pub mod format;
pub mod packfile;
pub mod state;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use zeroize::Zeroizing;

use coffre_protocol::{ByteRange, ResourceKind};
use coffre_types::{CoffreError, Mac, Result};

use crate::crypto::{self, EncryptionBlock};
use crate::platform::shell;
use crate::storage::{Store, StoreConfig};

pub use format::{Configuration, PackfileParams, STORAGE_VERSION};
pub use packfile::{BlobType, IndexEntry, Packfile, PackfileBuilder, PackfileFooter};
pub use state::{AggregateState, DeltaEntry, LocalState};

use crate::snapshot::Snapshot;

// Key material for content addressing in unencrypted repositories,
// mixed with the repository id so distinct repos address differently.
const PLAINTEXT_OBJECT_KEY: [u8; 32] = *b"coffre plaintext object key 0001";

/// One `(state_id, packfile)` pair from a packfile footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackfileEntry {
    pub state_id: Mac,
    pub packfile: Mac,
}

/// A repository over a storage backend: configuration, optional secret,
/// and the coalesced state derived from the store's state files.
pub struct Repository {
    store: Box<dyn Store>,
    configuration: Configuration,
    secret: Option<Zeroizing<[u8; 32]>>,
    cache_dir: PathBuf,
    state: RwLock<AggregateState>,
}

impl Repository {
    /// Create a new repository at `store`.
    pub fn init(
        store: Box<dyn Store>,
        encryption: Option<EncryptionBlock>,
        cache_dir: &Path,
    ) -> Result<Repository> {
        let configuration = Configuration::new(encryption);
        store.create(&configuration.wrap()?)?;
        Ok(Repository {
            store,
            configuration,
            secret: None,
            cache_dir: cache_dir.to_path_buf(),
            state: RwLock::new(AggregateState::default()),
        })
    }

    /// Open a repository without triggering a state rebuild. The cached
    /// aggregate from a previous rebuild is loaded when present.
    pub fn open_no_rebuild(
        store: Box<dyn Store>,
        serialized_config: &[u8],
        secret: Option<Zeroizing<[u8; 32]>>,
        cache_dir: &Path,
    ) -> Result<Repository> {
        let configuration = Configuration::from_wrapped_bytes(serialized_config)?;
        let repo = Repository {
            store,
            configuration,
            secret,
            cache_dir: cache_dir.to_path_buf(),
            state: RwLock::new(AggregateState::default()),
        };
        if let Some(cached) = repo.load_state_cache()? {
            *repo.state.write().unwrap() = cached;
        }
        Ok(repo)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn set_secret(&mut self, secret: Zeroizing<[u8; 32]>) {
        self.secret = Some(secret);
    }

    /// The key under which this repository's blobs are content-addressed.
    pub fn object_key(&self) -> [u8; 32] {
        match &self.secret {
            Some(secret) => **secret,
            None => {
                Mac::compute(
                    &PLAINTEXT_OBJECT_KEY,
                    self.configuration.repository_id.as_bytes(),
                )
                .0
            }
        }
    }

    /// Run `f` against the coalesced state.
    pub fn with_state<R>(&self, f: impl FnOnce(&AggregateState) -> R) -> R {
        f(&self.state.read().unwrap())
    }

    // ── State construction ────────────────────────────────────────────

    /// Full rebuild: fetch and merge every remote state file into a fresh
    /// aggregate, then persist it to the scan cache.
    pub fn rebuild_state(&self) -> Result<()> {
        let state_ids = self.get_states()?;
        tracing::debug!(
            repo = %self.configuration.repository_id,
            states = state_ids.len(),
            "rebuilding state"
        );

        let mut aggregate = AggregateState::default();
        for state_id in state_ids {
            let raw = self.store.get(ResourceKind::State, state_id, None)?;
            let local = LocalState::from_stream(&raw)?;
            aggregate.merge(state_id, &local);
        }

        self.persist_state_cache(&aggregate)?;
        *self.state.write().unwrap() = aggregate;
        Ok(())
    }

    /// Incremental: merge one state file into the current aggregate.
    pub fn ingest_state_file(&self, state_id: Mac) -> Result<()> {
        let raw = self.store.get(ResourceKind::State, state_id, None)?;
        let local = LocalState::from_stream(&raw)?;

        let mut guard = self.state.write().unwrap();
        guard.merge(state_id, &local);
        self.persist_state_cache(&guard)
    }

    /// Re-read the persisted scan cache, picking up rebuilds done by
    /// another process (the daemon) sharing this cache directory.
    /// Returns false when no cache exists yet.
    pub fn reload_state_cache(&self) -> Result<bool> {
        match self.load_state_cache()? {
            Some(aggregate) => {
                *self.state.write().unwrap() = aggregate;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Merge a state produced locally (e.g. by a fresh backup commit).
    pub fn absorb_state(&self, state_id: Mac, local: &LocalState) -> Result<()> {
        let mut guard = self.state.write().unwrap();
        guard.merge(state_id, local);
        self.persist_state_cache(&guard)
    }

    // ── Store surface ─────────────────────────────────────────────────

    pub fn get_states(&self) -> Result<Vec<Mac>> {
        self.store.list(ResourceKind::State)
    }

    pub fn put_state(&self, state_id: Mac, data: &[u8]) -> Result<()> {
        self.store.put(ResourceKind::State, state_id, data)?;
        Ok(())
    }

    pub fn delete_state(&self, state_id: Mac) -> Result<()> {
        self.store.delete(ResourceKind::State, state_id)
    }

    /// Fetch and parse a packfile, verifying its content address.
    pub fn get_packfile(&self, mac: Mac) -> Result<Packfile> {
        let raw = self.store.get(ResourceKind::Packfile, mac, None)?;
        if Mac::compute(&self.object_key(), &raw) != mac {
            return Err(CoffreError::InvalidFormat(format!(
                "packfile {mac} fails its content address"
            )));
        }
        Packfile::from_bytes(raw)
    }

    pub fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<()> {
        self.store.put(ResourceKind::Packfile, mac, data)?;
        Ok(())
    }

    pub fn delete_packfile(&self, mac: Mac) -> Result<()> {
        self.store.delete(ResourceKind::Packfile, mac)
    }

    /// Stream of `(state_id, packfile)` pairs read from packfile footers.
    pub fn list_packfile_entries(&self) -> Result<Vec<PackfileEntry>> {
        let mut entries = Vec::new();
        for packfile in self.store.list(ResourceKind::Packfile)? {
            let footer = packfile::read_footer(self.store.as_ref(), ResourceKind::Packfile, packfile)?;
            entries.push(PackfileEntry {
                state_id: footer.state_id,
                packfile,
            });
        }
        Ok(entries)
    }

    // ── Blob and snapshot reads ───────────────────────────────────────

    /// Read one blob through the coalesced state index, verifying its MAC.
    pub fn read_blob(&self, mac: Mac) -> Result<Vec<u8>> {
        let entry = self
            .with_state(|s| s.lookup(mac).copied())
            .ok_or_else(|| CoffreError::ResourceNotFound(format!("blob {mac}")))?;

        let data = self.store.get(
            ResourceKind::Packfile,
            entry.packfile,
            Some(ByteRange {
                offset: entry.offset,
                length: entry.length,
            }),
        )?;
        if Mac::compute(&self.object_key(), &data) != mac {
            return Err(CoffreError::InvalidFormat(format!(
                "blob {mac} fails its content address"
            )));
        }
        Ok(data)
    }

    /// Live snapshot identifiers from the coalesced state.
    pub fn locate_snapshot_ids(&self) -> Vec<Mac> {
        self.with_state(|s| s.snapshots())
    }

    pub fn load_snapshot(&self, identifier: Mac) -> Result<Snapshot> {
        let raw = self.read_blob(identifier).map_err(|e| match e {
            CoffreError::ResourceNotFound(_) => {
                CoffreError::SnapshotNotFound(identifier.to_hex())
            }
            other => other,
        })?;
        Snapshot::from_bytes(&raw)
    }

    // ── Scan cache ────────────────────────────────────────────────────

    fn state_cache_path(&self) -> PathBuf {
        self.cache_dir
            .join("state-cache")
            .join(format!("{}.cache", self.configuration.repository_id))
    }

    fn persist_state_cache(&self, aggregate: &AggregateState) -> Result<()> {
        let path = self.state_cache_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = rmp_serde::to_vec_named(aggregate)?;
        fs::write(&path, bytes)?;
        Ok(())
    }

    fn load_state_cache(&self) -> Result<Option<AggregateState>> {
        let path = self.state_cache_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoffreError::Io(e)),
        };
        match rmp_serde::from_slice(&bytes) {
            Ok(agg) => Ok(Some(agg)),
            Err(e) => {
                // A stale or corrupt cache is rebuilt on the next refresh.
                tracing::warn!("discarding unreadable state cache {}: {e}", path.display());
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }
}

/// Current time in nanoseconds since the epoch, saturating.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Resolve the repository secret for an encrypted configuration.
///
/// Order: a pre-derived 32-byte secret when given, else the store
/// config's `passphrase`, else the output of `passphrase_cmd`. The
/// derived key is verified against the configuration's canary.
pub fn resolve_secret(
    configuration: &Configuration,
    store_config: &StoreConfig,
    provided: &[u8],
) -> Result<Option<Zeroizing<[u8; 32]>>> {
    let encryption = match &configuration.encryption {
        None => return Ok(None),
        Some(block) => block,
    };

    let key: Zeroizing<[u8; 32]> = if !provided.is_empty() {
        let bytes: [u8; 32] = provided
            .try_into()
            .map_err(|_| CoffreError::KeyVerification)?;
        Zeroizing::new(bytes)
    } else {
        let passphrase = match store_config.get("passphrase") {
            Some(p) => Zeroizing::new(p.clone().into_bytes()),
            None => match store_config.get("passphrase_cmd") {
                Some(cmd) => passphrase_from_command(cmd)?,
                None => {
                    return Err(CoffreError::Config("no passphrase specified".into()));
                }
            },
        };
        crypto::derive_key(&encryption.kdf, &passphrase)?
    };

    if !crypto::verify_canary(encryption, &key) {
        return Err(CoffreError::KeyVerification);
    }
    Ok(Some(key))
}

/// Run a shell command and read its standard output once as the secret.
fn passphrase_from_command(cmd: &str) -> Result<Zeroizing<Vec<u8>>> {
    let output = shell::run_script_with_timeout(cmd, std::time::Duration::from_secs(60))?;
    if !output.status.success() {
        return Err(CoffreError::Config(format!(
            "passphrase_cmd failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let mut raw = output.stdout;
    // Trim one trailing newline, the usual shell artifact.
    if raw.last() == Some(&b'\n') {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    }
    if raw.is_empty() {
        return Err(CoffreError::Config(
            "passphrase_cmd returned an empty passphrase".into(),
        ));
    }
    Ok(Zeroizing::new(raw))
}
