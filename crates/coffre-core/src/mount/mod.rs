//! Read-only mount model over the repository's snapshots.
//!
//! The virtual layout is two-level: the root lists one directory per
//! live snapshot (named by the first 4 bytes of its identifier, hex),
//! and each snapshot directory mirrors that snapshot's file tree. The
//! root listing is refreshed through the state daemon, rate-limited;
//! everything below is served from the coalesced state.
//!
//! This module is the snapshot-tree model only; kernel FUSE plumbing
//! sits elsewhere and consumes these nodes, as does the HTTP variant.

pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use coffre_types::{CoffreError, Mac, Result};

use crate::repo::Repository;
use crate::snapshot::{ChunkRef, ItemKind, Snapshot};

/// How often the root listing may trigger a daemon-backed refresh.
pub const ROOT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
/// How long node attributes may be cached by the consumer (kernel TTL).
pub const ATTR_TTL: Duration = Duration::from_secs(60);

/// Called before re-enumerating snapshots; wired to the cached client.
pub type Refresher = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// One child of the mount root.
#[derive(Debug, Clone)]
pub struct RootEntry {
    /// First 4 bytes of the snapshot identifier, hex (8 chars).
    pub name: String,
    pub snapshot_id: Mac,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Attributes common to every node.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub kind: ItemKind,
    pub mode: u32,
    pub size: u64,
    /// Nanoseconds since the epoch.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub ttl: Duration,
}

#[derive(Debug)]
pub struct DirNode {
    pub key: String,
    pub snapshot_id: Mac,
    /// Path within the snapshot; empty for the snapshot root.
    pub path: String,
    pub attr: NodeAttr,
}

#[derive(Debug)]
pub struct FileNode {
    pub key: String,
    pub snapshot_id: Mac,
    pub path: String,
    pub attr: NodeAttr,
    pub link_target: Option<String>,
    chunks: Vec<ChunkRef>,
}

/// A resolved child node.
#[derive(Debug, Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl Node {
    pub fn attr(&self) -> NodeAttr {
        match self {
            Node::Dir(d) => d.attr,
            Node::File(f) => f.attr,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Node::Dir(d) => &d.key,
            Node::File(f) => &f.key,
        }
    }
}

struct RootCache {
    last_refresh: Option<Instant>,
    entries: Vec<RootEntry>,
}

/// The snapshot filesystem model: root listing, inode cache, handles.
pub struct SnapshotFs {
    repo: Arc<Repository>,
    refresher: Refresher,
    root_refresh: Duration,
    attr_ttl: Duration,
    root: Mutex<RootCache>,
    // Files and directories live in separate maps under separate locks.
    files: Mutex<HashMap<String, Arc<FileNode>>>,
    dirs: Mutex<HashMap<String, Arc<DirNode>>>,
    snapshots: Mutex<HashMap<Mac, Arc<Snapshot>>>,
}

/// Stable cache key for a node: kind, snapshot, path.
pub(crate) fn stable_key(parts: &[&str]) -> String {
    parts.join("/")
}

impl SnapshotFs {
    pub fn new(repo: Arc<Repository>, refresher: Refresher) -> SnapshotFs {
        SnapshotFs::with_intervals(repo, refresher, ROOT_REFRESH_INTERVAL, ATTR_TTL)
    }

    pub fn with_intervals(
        repo: Arc<Repository>,
        refresher: Refresher,
        root_refresh: Duration,
        attr_ttl: Duration,
    ) -> SnapshotFs {
        SnapshotFs {
            repo,
            refresher,
            root_refresh,
            attr_ttl,
            root: Mutex::new(RootCache {
                last_refresh: None,
                entries: Vec::new(),
            }),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Enumerate the root. At most one daemon-backed refresh per
    /// [`ROOT_REFRESH_INTERVAL`]; the cached listing is returned between
    /// refreshes.
    pub fn root_entries(&self) -> Result<Vec<RootEntry>> {
        let mut root = self.root.lock().unwrap();
        let stale = match root.last_refresh {
            None => true,
            Some(t) => t.elapsed() >= self.root_refresh,
        };
        if !stale {
            return Ok(root.entries.clone());
        }

        (self.refresher)()?;

        let mut entries = Vec::new();
        for snapshot_id in self.repo.locate_snapshot_ids() {
            let snapshot = match self.load_snapshot(snapshot_id) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("skipping unreadable snapshot {snapshot_id}: {e}");
                    continue;
                }
            };
            entries.push(RootEntry {
                name: snapshot_id.short_hex(),
                snapshot_id,
                size: snapshot.header.summary.total_size(),
                timestamp: snapshot.header.timestamp,
            });
        }
        entries.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));

        root.entries = entries.clone();
        root.last_refresh = Some(Instant::now());
        Ok(entries)
    }

    /// Resolve a root child by its 8-char name or full hex identifier.
    pub fn lookup_snapshot(&self, name: &str) -> Result<Arc<DirNode>> {
        let entries = self.root_entries()?;
        let entry = entries
            .iter()
            .find(|e| e.name == name || e.snapshot_id.to_hex() == name)
            .ok_or_else(|| CoffreError::SnapshotNotFound(name.to_string()))?;

        let key = stable_key(&["snapshot", &entry.snapshot_id.to_hex()]);
        if let Some(dir) = self.dirs.lock().unwrap().get(&key) {
            return Ok(Arc::clone(dir));
        }

        let dir = Arc::new(DirNode {
            key: key.clone(),
            snapshot_id: entry.snapshot_id,
            path: String::new(),
            attr: NodeAttr {
                kind: ItemKind::Directory,
                mode: 0o700,
                size: entry.size,
                mtime: entry
                    .timestamp
                    .timestamp_nanos_opt()
                    .unwrap_or(0),
                uid: euid(),
                gid: egid(),
                ttl: self.attr_ttl,
            },
        });
        self.dirs.lock().unwrap().insert(key, Arc::clone(&dir));
        Ok(dir)
    }

    /// Resolve one child of a directory node.
    pub fn lookup(&self, dir: &DirNode, name: &str) -> Result<Node> {
        let path = if dir.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", dir.path)
        };
        let snapshot = self.load_snapshot(dir.snapshot_id)?;
        let item = snapshot
            .item(&path)
            .ok_or_else(|| CoffreError::ResourceNotFound(path.clone()))?;

        let snap_hex = dir.snapshot_id.to_hex();
        match item.kind {
            ItemKind::Directory => {
                let key = stable_key(&["directory", &snap_hex, &path]);
                if let Some(cached) = self.dirs.lock().unwrap().get(&key) {
                    return Ok(Node::Dir(Arc::clone(cached)));
                }
                let node = Arc::new(DirNode {
                    key: key.clone(),
                    snapshot_id: dir.snapshot_id,
                    path,
                    attr: self.attr_from_item(item),
                });
                self.dirs.lock().unwrap().insert(key, Arc::clone(&node));
                Ok(Node::Dir(node))
            }
            ItemKind::File | ItemKind::Symlink => {
                let key = stable_key(&["file", &snap_hex, &path]);
                if let Some(cached) = self.files.lock().unwrap().get(&key) {
                    return Ok(Node::File(Arc::clone(cached)));
                }
                let node = Arc::new(FileNode {
                    key: key.clone(),
                    snapshot_id: dir.snapshot_id,
                    path,
                    attr: self.attr_from_item(item),
                    link_target: item.link_target.clone(),
                    chunks: item.chunks.clone(),
                });
                self.files.lock().unwrap().insert(key, Arc::clone(&node));
                Ok(Node::File(node))
            }
        }
    }

    /// Names and kinds of a directory's children.
    pub fn read_dir(&self, dir: &DirNode) -> Result<Vec<(String, ItemKind)>> {
        let snapshot = self.load_snapshot(dir.snapshot_id)?;
        Ok(snapshot
            .children_of(&dir.path)
            .map(|item| (item.name().to_string(), item.kind))
            .collect())
    }

    /// Open a file node for reading.
    pub fn open(&self, file: &Arc<FileNode>) -> FileHandle {
        FileHandle {
            repo: Arc::clone(&self.repo),
            file: Arc::clone(file),
        }
    }

    /// Drop a node from the cache (kernel `forget`).
    pub fn forget(&self, key: &str) {
        self.files.lock().unwrap().remove(key);
        self.dirs.lock().unwrap().remove(key);
    }

    /// Number of cached nodes, for diagnostics.
    pub fn cached_nodes(&self) -> usize {
        self.files.lock().unwrap().len() + self.dirs.lock().unwrap().len()
    }

    fn attr_from_item(&self, item: &crate::snapshot::Item) -> NodeAttr {
        NodeAttr {
            kind: item.kind,
            mode: item.mode,
            size: item.size,
            mtime: item.mtime.max(0),
            // Owner and group default to the mounting process; the
            // snapshot item model carries none.
            uid: euid(),
            gid: egid(),
            ttl: self.attr_ttl,
        }
    }

    fn load_snapshot(&self, snapshot_id: Mac) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.snapshots.lock().unwrap().get(&snapshot_id) {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(self.repo.load_snapshot(snapshot_id)?);
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot_id, Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

/// Open read handle on one file.
pub struct FileHandle {
    repo: Arc<Repository>,
    file: Arc<FileNode>,
}

impl FileHandle {
    /// Read up to `len` bytes at `offset`. A short (or empty) read at the
    /// end of the file is normal.
    pub fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk_start = 0u64;
        let end = offset + len as u64;

        for chunk in &self.file.chunks {
            let chunk_end = chunk_start + chunk.length as u64;
            if chunk_end > offset && chunk_start < end {
                let data = self.repo.read_blob(chunk.mac)?;
                let from = offset.saturating_sub(chunk_start) as usize;
                let to = ((end - chunk_start).min(chunk.length as u64)) as usize;
                out.extend_from_slice(&data[from..to]);
            }
            chunk_start = chunk_end;
            if chunk_start >= end {
                break;
            }
        }
        Ok(out)
    }

    /// The whole file, reassembled.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.file.attr.size as usize);
        for chunk in &self.file.chunks {
            out.extend_from_slice(&self.repo.read_blob(chunk.mac)?);
        }
        Ok(out)
    }
}

/// The error surfaced for any mutation attempt on the mount.
pub fn erofs() -> CoffreError {
    CoffreError::Io(std::io::Error::from_raw_os_error(libc::EROFS))
}

/// The error surfaced for unsupported operations (xattrs, locks).
pub fn enotsup() -> CoffreError {
    CoffreError::Io(std::io::Error::from_raw_os_error(libc::ENOTSUP))
}

fn euid() -> u32 {
    unsafe { libc::geteuid() }
}

fn egid() -> u32 {
    unsafe { libc::getegid() }
}
