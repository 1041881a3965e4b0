use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use serde::{Deserialize, Serialize};

use coffre_types::{CoffreError, Mac, Result};

use super::packfile::BlobType;

pub const STATE_VERSION: u32 = 1;

/// State-file metadata, written as the first record of the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMetadata {
    pub version: u32,
    /// Nanoseconds since the epoch; the minimum over the footers of the
    /// packfiles this state covers.
    pub timestamp: i64,
}

/// Where one blob lives: which packfile, at what offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub etype: BlobType,
    pub version: u32,
    pub mac: Mac,
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
}

/// One record in a serialized state stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateRecord {
    Delta(DeltaEntry),
    Packfile { state_id: Mac, packfile: Mac },
}

/// A state accumulator: delta entries plus packfile membership, written
/// out as a msgpack stream headed by [`StateMetadata`].
#[derive(Debug, Clone)]
pub struct LocalState {
    pub metadata: StateMetadata,
    deltas: BTreeMap<(BlobType, Mac, Mac), DeltaEntry>,
    packfiles: BTreeSet<(Mac, Mac)>,
}

impl LocalState {
    pub fn new(now_nanos: i64) -> Self {
        LocalState {
            metadata: StateMetadata {
                version: STATE_VERSION,
                timestamp: now_nanos,
            },
            deltas: BTreeMap::new(),
            packfiles: BTreeSet::new(),
        }
    }

    /// Pull the timestamp down to a packfile footer's, keeping the minimum.
    pub fn observe_timestamp(&mut self, footer_nanos: i64) {
        if footer_nanos < self.metadata.timestamp {
            self.metadata.timestamp = footer_nanos;
        }
    }

    /// Insert a delta record. Re-inserting the same `(type, blob, packfile)`
    /// triple is a no-op, which deduplicates repeated packfile scans.
    pub fn put_delta(&mut self, delta: DeltaEntry) {
        self.deltas
            .entry((delta.etype, delta.mac, delta.packfile))
            .or_insert(delta);
    }

    /// Record that `packfile` belongs to `state_id`.
    pub fn put_packfile(&mut self, state_id: Mac, packfile: Mac) {
        self.packfiles.insert((state_id, packfile));
    }

    pub fn deltas(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.deltas.values()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Write the metadata record followed by every delta and packfile
    /// record to `w` as a msgpack stream.
    pub fn serialize_to_stream(&self, mut w: impl Write) -> Result<()> {
        let meta = rmp_serde::to_vec_named(&self.metadata)?;
        w.write_all(&meta)?;
        for delta in self.deltas.values() {
            let rec = rmp_serde::to_vec_named(&StateRecord::Delta(*delta))?;
            w.write_all(&rec)?;
        }
        for (state_id, packfile) in &self.packfiles {
            let rec = rmp_serde::to_vec_named(&StateRecord::Packfile {
                state_id: *state_id,
                packfile: *packfile,
            })?;
            w.write_all(&rec)?;
        }
        Ok(())
    }

    /// Parse a serialized state stream.
    pub fn from_stream(data: &[u8]) -> Result<LocalState> {
        let mut de = rmp_serde::Deserializer::new(data);
        let metadata: StateMetadata = Deserialize::deserialize(&mut de)?;
        if metadata.version != STATE_VERSION {
            return Err(CoffreError::UnsupportedVersion(metadata.version));
        }

        let mut state = LocalState {
            metadata,
            deltas: BTreeMap::new(),
            packfiles: BTreeSet::new(),
        };
        loop {
            match StateRecord::deserialize(&mut de) {
                Ok(StateRecord::Delta(delta)) => state.put_delta(delta),
                Ok(StateRecord::Packfile { state_id, packfile }) => {
                    state.put_packfile(state_id, packfile)
                }
                Err(rmp_serde::decode::Error::InvalidMarkerRead(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(state)
    }
}

/// The coalesced view over every ingested state: blob location lookup,
/// packfile membership, and the set of state ids already merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateState {
    entries: BTreeMap<Mac, DeltaEntry>,
    tombstones: BTreeSet<Mac>,
    packfiles: BTreeSet<(Mac, Mac)>,
    merged_states: BTreeSet<Mac>,
}

impl AggregateState {
    pub fn merge(&mut self, state_id: Mac, state: &LocalState) {
        for delta in state.deltas() {
            match delta.etype {
                BlobType::SnapshotTombstone => {
                    self.tombstones.insert(delta.mac);
                }
                _ => {
                    self.entries.insert(delta.mac, *delta);
                }
            }
        }
        for (sid, packfile) in &state.packfiles {
            self.packfiles.insert((*sid, *packfile));
        }
        self.merged_states.insert(state_id);
    }

    pub fn lookup(&self, mac: Mac) -> Option<&DeltaEntry> {
        self.entries.get(&mac)
    }

    pub fn has_state(&self, state_id: Mac) -> bool {
        self.merged_states.contains(&state_id)
    }

    pub fn merged_states(&self) -> impl Iterator<Item = &Mac> {
        self.merged_states.iter()
    }

    /// Live snapshot identifiers: committed and not tombstoned.
    pub fn snapshots(&self) -> Vec<Mac> {
        self.entries
            .values()
            .filter(|d| d.etype == BlobType::Snapshot && !self.tombstones.contains(&d.mac))
            .map(|d| d.mac)
            .collect()
    }

    pub fn is_tombstoned(&self, mac: Mac) -> bool {
        self.tombstones.contains(&mac)
    }

    /// All `(state_id, packfile)` membership pairs.
    pub fn packfile_memberships(&self) -> impl Iterator<Item = &(Mac, Mac)> {
        self.packfiles.iter()
    }

    /// Every delta entry, in blob-MAC order.
    pub fn entries(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.entries.values()
    }

    /// Forget entries located in `packfile` and the membership rows that
    /// reference it. Used by maintenance after deleting a packfile.
    pub fn evict_packfile(&mut self, packfile: Mac) {
        self.entries.retain(|_, d| d.packfile != packfile);
        self.packfiles.retain(|(_, pf)| *pf != packfile);
    }

    pub fn forget_state(&mut self, state_id: Mac) {
        self.merged_states.remove(&state_id);
        self.packfiles.retain(|(sid, _)| *sid != state_id);
    }
}
