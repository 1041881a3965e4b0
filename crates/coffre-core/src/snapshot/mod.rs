pub mod item;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coffre_types::{Mac, Result};

pub use item::{ChunkRef, Item, ItemKind};

/// Aggregate sizes recorded in a snapshot header. The mount surface uses
/// `directory_size + below_size` as the snapshot's top-level size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub files: u64,
    pub directories: u64,
    pub directory_size: u64,
    pub below_size: u64,
}

impl SnapshotSummary {
    pub fn total_size(&self) -> u64 {
        self.directory_size + self.below_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub identifier: Mac,
    pub timestamp: DateTime<Utc>,
    pub repository_id: Uuid,
    /// Job name for scheduler-committed snapshots; empty for ad-hoc runs.
    pub job: String,
    pub tags: Vec<String>,
    pub summary: SnapshotSummary,
}

/// A point-in-time, read-only view of an imported source: a header plus
/// the flat item list, serialized as one snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub items: Vec<Item>,
}

impl Snapshot {
    /// Compute the snapshot identifier and produce the sealed blob bytes.
    ///
    /// The identifier is the MAC of the serialized snapshot with a zero
    /// identifier, so it is deterministic for identical content; the
    /// returned bytes carry the final identifier.
    pub fn seal(mut self, object_key: &[u8; 32]) -> Result<(Mac, Vec<u8>)> {
        self.header.identifier = Mac::ZERO;
        let unsealed = rmp_serde::to_vec_named(&self)?;
        let identifier = Mac::compute(object_key, &unsealed);
        self.header.identifier = identifier;
        let sealed = rmp_serde::to_vec_named(&self)?;
        Ok((identifier, sealed))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Snapshot> {
        Ok(rmp_serde::from_slice(data)?)
    }

    /// Find an item by its path.
    pub fn item(&self, path: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.path == path)
    }

    /// Direct children of `dir` ("" is the snapshot root).
    pub fn children_of<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a Item> {
        self.items.iter().filter(move |item| {
            let rest = match strip_dir(&item.path, dir) {
                Some(rest) if !rest.is_empty() => rest,
                _ => return false,
            };
            !rest.contains('/')
        })
    }
}

fn strip_dir<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir.is_empty() {
        return Some(path);
    }
    path.strip_prefix(dir)?.strip_prefix('/')
}
