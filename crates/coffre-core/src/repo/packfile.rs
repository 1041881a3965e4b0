use serde::{Deserialize, Serialize};

use coffre_protocol::ByteRange;
use coffre_types::{CoffreError, Mac, Result};

use crate::storage::Store;

pub const PACKFILE_VERSION: u32 = 1;

/// What a blob inside a packfile is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlobType {
    /// File content.
    Chunk,
    /// A serialized snapshot (header + item list).
    Snapshot,
    /// Marks a previously committed snapshot as deleted.
    SnapshotTombstone,
}

/// One blob's position inside a packfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub etype: BlobType,
    pub version: u32,
    pub mac: Mac,
    pub offset: u64,
    pub length: u32,
}

/// Trailing footer of a packfile. The container is
/// `[blob bytes...][msgpack footer][u32-le footer length]`, so the footer
/// can be located from the end with two range reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackfileFooter {
    pub version: u32,
    /// The state this packfile was committed under.
    pub state_id: Mac,
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub index: Vec<IndexEntry>,
}

/// A fully fetched packfile: the blob region plus its parsed footer.
#[derive(Debug, Clone)]
pub struct Packfile {
    pub footer: PackfileFooter,
    data: Vec<u8>,
}

impl Packfile {
    /// Parse a packfile from its full serialized bytes.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Packfile> {
        if raw.len() < 4 {
            return Err(CoffreError::InvalidFormat("packfile too short".into()));
        }
        let footer_len =
            u32::from_le_bytes(raw[raw.len() - 4..].try_into().expect("4 bytes")) as usize;
        let data_len = raw
            .len()
            .checked_sub(4 + footer_len)
            .ok_or_else(|| CoffreError::InvalidFormat("packfile footer length".into()))?;

        let footer: PackfileFooter = rmp_serde::from_slice(&raw[data_len..raw.len() - 4])?;
        if footer.version != PACKFILE_VERSION {
            return Err(CoffreError::UnsupportedVersion(footer.version));
        }
        for entry in &footer.index {
            let end = entry
                .offset
                .checked_add(entry.length as u64)
                .ok_or_else(|| CoffreError::InvalidFormat("blob range overflow".into()))?;
            if end > data_len as u64 {
                return Err(CoffreError::InvalidFormat(format!(
                    "blob {} extends past the data region",
                    entry.mac
                )));
            }
        }

        let mut data = raw;
        data.truncate(data_len);
        Ok(Packfile { footer, data })
    }

    /// Read a blob by index entry from an already-fetched packfile.
    pub fn blob(&self, entry: &IndexEntry) -> &[u8] {
        &self.data[entry.offset as usize..(entry.offset + entry.length as u64) as usize]
    }

    pub fn data_len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Read just the footer of a stored packfile using two range reads
/// (length word, then the footer itself), avoiding a full fetch.
pub fn read_footer(
    store: &dyn Store,
    kind: coffre_protocol::ResourceKind,
    mac: Mac,
) -> Result<PackfileFooter> {
    let total = store.size(kind, mac)?;
    if total < 4 {
        return Err(CoffreError::InvalidFormat("packfile too short".into()));
    }
    let len_bytes = store.get(
        kind,
        mac,
        Some(ByteRange {
            offset: total - 4,
            length: 4,
        }),
    )?;
    let footer_len = u32::from_le_bytes(
        len_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoffreError::InvalidFormat("packfile length word".into()))?,
    ) as u64;
    if footer_len == 0 || footer_len + 4 > total {
        return Err(CoffreError::InvalidFormat("packfile footer length".into()));
    }

    let footer_bytes = store.get(
        kind,
        mac,
        Some(ByteRange {
            offset: total - 4 - footer_len,
            length: footer_len as u32,
        }),
    )?;
    let footer: PackfileFooter = rmp_serde::from_slice(&footer_bytes)?;
    if footer.version != PACKFILE_VERSION {
        return Err(CoffreError::UnsupportedVersion(footer.version));
    }
    Ok(footer)
}

/// Accumulates blobs for one packfile and seals it into its serialized
/// form. The packfile's MAC is computed over the full container bytes.
pub struct PackfileBuilder {
    state_id: Mac,
    timestamp: i64,
    data: Vec<u8>,
    index: Vec<IndexEntry>,
}

impl PackfileBuilder {
    pub fn new(state_id: Mac, timestamp: i64) -> Self {
        PackfileBuilder {
            state_id,
            timestamp,
            data: Vec::new(),
            index: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn data_len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Append a blob; returns its index entry.
    pub fn add_blob(&mut self, etype: BlobType, mac: Mac, blob: &[u8]) -> Result<IndexEntry> {
        let length = u32::try_from(blob.len())
            .map_err(|_| CoffreError::InvalidFormat("blob larger than 4 GiB".into()))?;
        let entry = IndexEntry {
            etype,
            version: PACKFILE_VERSION,
            mac,
            offset: self.data.len() as u64,
            length,
        };
        self.data.extend_from_slice(blob);
        self.index.push(entry);
        Ok(entry)
    }

    /// Seal into `(packfile MAC, container bytes, footer)`.
    pub fn finish(self, object_key: &[u8; 32]) -> Result<(Mac, Vec<u8>, PackfileFooter)> {
        let footer = PackfileFooter {
            version: PACKFILE_VERSION,
            state_id: self.state_id,
            timestamp: self.timestamp,
            index: self.index,
        };
        let footer_bytes = rmp_serde::to_vec_named(&footer)?;
        let footer_len = u32::try_from(footer_bytes.len())
            .map_err(|_| CoffreError::InvalidFormat("footer larger than 4 GiB".into()))?;

        let mut out = self.data;
        out.extend_from_slice(&footer_bytes);
        out.extend_from_slice(&footer_len.to_le_bytes());

        let mac = Mac::compute(object_key, &out);
        Ok((mac, out, footer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x11; 32];

    fn build_sample() -> (Mac, Vec<u8>, PackfileFooter) {
        let mut builder = PackfileBuilder::new(Mac([0xA0; 32]), 1_234_567_890);
        let m1 = Mac::compute(&KEY, b"first blob");
        let m2 = Mac::compute(&KEY, b"second blob");
        builder.add_blob(BlobType::Chunk, m1, b"first blob").unwrap();
        builder.add_blob(BlobType::Snapshot, m2, b"second blob").unwrap();
        builder.finish(&KEY).unwrap()
    }

    #[test]
    fn build_then_parse_round_trip() {
        let (mac, raw, footer) = build_sample();
        assert_eq!(mac, Mac::compute(&KEY, &raw));

        let pack = Packfile::from_bytes(raw).unwrap();
        assert_eq!(pack.footer.state_id, footer.state_id);
        assert_eq!(pack.footer.timestamp, 1_234_567_890);
        assert_eq!(pack.footer.index.len(), 2);
        assert_eq!(pack.blob(&pack.footer.index[0]), b"first blob");
        assert_eq!(pack.blob(&pack.footer.index[1]), b"second blob");
    }

    #[test]
    fn offsets_are_contiguous() {
        let (_, raw, _) = build_sample();
        let pack = Packfile::from_bytes(raw).unwrap();
        let idx = &pack.footer.index;
        assert_eq!(idx[0].offset, 0);
        assert_eq!(idx[1].offset, idx[0].length as u64);
        assert_eq!(pack.data_len(), (idx[1].offset + idx[1].length as u64));
    }

    #[test]
    fn truncated_packfile_rejected() {
        assert!(Packfile::from_bytes(vec![1, 2]).is_err());
    }

    #[test]
    fn corrupt_length_word_rejected() {
        let (_, mut raw, _) = build_sample();
        let n = raw.len();
        raw[n - 4..].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(Packfile::from_bytes(raw).is_err());
    }

    #[test]
    fn footer_via_range_reads_matches_full_parse() {
        use crate::storage::{mock_backend::MockStore, Store};
        use coffre_protocol::ResourceKind;

        MockStore::reset("packfile-footer");
        let store = MockStore::shared("packfile-footer");

        let (mac, raw, footer) = build_sample();
        store.put(ResourceKind::Packfile, mac, &raw).unwrap();

        let read = read_footer(&store, ResourceKind::Packfile, mac).unwrap();
        assert_eq!(read.state_id, footer.state_id);
        assert_eq!(read.index, footer.index);
    }
}
