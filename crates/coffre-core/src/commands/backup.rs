use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use rand::RngCore;
use uuid::Uuid;

use coffre_types::{CoffreError, Mac, Result};

use crate::events::{Event, EventBus, WORKFLOW_END, WORKFLOW_START};
use crate::repo::state::{DeltaEntry, LocalState};
use crate::repo::{now_nanos, BlobType, PackfileBuilder, Repository};
use crate::snapshot::{ChunkRef, Item, Snapshot, SnapshotHeader, SnapshotSummary};

/// Files are split at fixed boundaries; real chunkers are smarter but the
/// packfile format only cares that blobs stay below 4 GiB.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub struct BackupOptions {
    pub job: String,
    pub tags: Vec<String>,
    pub excludes: Vec<String>,
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub snapshot_id: Mac,
    pub state_id: Mac,
    pub files: u64,
    pub bytes_stored: u64,
}

/// Walk `source`, commit its content as one snapshot and publish the
/// session's state file. Chunks already present in the coalesced state
/// are referenced, not rewritten.
pub fn run(
    repo: &Repository,
    source: &Path,
    opts: &BackupOptions,
    events: Option<&EventBus>,
) -> Result<BackupOutcome> {
    let run_id = Uuid::new_v4();
    if let Some(bus) = events {
        bus.emit(Event::new(WORKFLOW_START, "backup", run_id));
    }

    let result = run_inner(repo, source, opts, run_id, events);

    if let Some(bus) = events {
        let mut end = Event::new(WORKFLOW_END, "backup", run_id);
        if let Err(e) = &result {
            end = end.with_level("error").with_data(
                "error",
                serde_json::Value::String(e.to_string()),
            );
        }
        bus.emit(end);
    }
    result
}

fn run_inner(
    repo: &Repository,
    source: &Path,
    opts: &BackupOptions,
    run_id: Uuid,
    events: Option<&EventBus>,
) -> Result<BackupOutcome> {
    let excludes = build_globset(&opts.excludes)?;
    let object_key = repo.object_key();

    let state_id = random_mac();
    let timestamp = now_nanos();

    let mut session = PackSession {
        repo,
        state_id,
        timestamp,
        builder: PackfileBuilder::new(state_id, timestamp),
        state: LocalState::new(timestamp),
        bytes_stored: 0,
        max_size: repo.configuration().packfile.max_size as u64,
    };

    let mut items = Vec::new();
    let mut summary = SnapshotSummary::default();

    for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| CoffreError::Other(format!("walking source: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| CoffreError::Other(format!("walking source: {e}")))?
            .to_string_lossy()
            .replace('\\', "/");

        if !rel.is_empty() && excludes.is_match(rel.as_str()) {
            continue;
        }

        let meta = entry
            .metadata()
            .map_err(|e| CoffreError::Other(format!("stat {rel}: {e}")))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let mode = mode_of(&meta);

        if meta.file_type().is_dir() {
            items.push(Item::dir(&rel, mode, mtime));
            summary.directories += 1;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            items.push(Item::symlink(&rel, mtime, &target.to_string_lossy()));
        } else if meta.file_type().is_file() {
            let data = std::fs::read(entry.path())?;
            let mut chunks = Vec::new();
            for piece in data.chunks(CHUNK_SIZE).filter(|p| !p.is_empty()) {
                let mac = Mac::compute(&object_key, piece);
                session.store_blob(BlobType::Chunk, mac, piece)?;
                chunks.push(ChunkRef {
                    mac,
                    length: piece.len() as u32,
                });
            }
            summary.files += 1;
            if rel.contains('/') {
                summary.below_size += data.len() as u64;
            } else {
                summary.directory_size += data.len() as u64;
            }
            items.push(Item::file(&rel, mode, mtime, data.len() as u64, chunks));
        }
    }

    let snapshot = Snapshot {
        header: SnapshotHeader {
            identifier: Mac::ZERO,
            timestamp: chrono::Utc::now(),
            repository_id: repo.configuration().repository_id,
            job: opts.job.clone(),
            tags: opts.tags.clone(),
            summary,
        },
        items,
    };
    let files = snapshot.header.summary.files;
    let (snapshot_id, sealed) = snapshot.seal(&object_key)?;
    session.store_blob(BlobType::Snapshot, snapshot_id, &sealed)?;

    let (state_id, bytes_stored) = session.commit()?;

    if let Some(bus) = events {
        bus.emit(
            Event::new("snapshot.commit", "backup", run_id)
                .with_snapshot(snapshot_id)
                .with_data("files", serde_json::Value::from(files)),
        );
    }

    tracing::info!(
        job = %opts.job,
        snapshot = %snapshot_id.short_hex(),
        files,
        bytes_stored,
        "snapshot committed"
    );

    Ok(BackupOutcome {
        snapshot_id,
        state_id,
        files,
        bytes_stored,
    })
}

/// Rolling packfile writer for one backup session.
struct PackSession<'a> {
    repo: &'a Repository,
    state_id: Mac,
    timestamp: i64,
    builder: PackfileBuilder,
    state: LocalState,
    bytes_stored: u64,
    max_size: u64,
}

impl PackSession<'_> {
    /// Store one blob unless the coalesced state already has it.
    fn store_blob(&mut self, etype: BlobType, mac: Mac, data: &[u8]) -> Result<()> {
        if self.repo.with_state(|s| s.lookup(mac).is_some()) {
            return Ok(());
        }
        if self.builder.data_len() + data.len() as u64 > self.max_size && !self.builder.is_empty()
        {
            self.seal_current()?;
        }
        self.builder.add_blob(etype, mac, data)?;
        self.bytes_stored += data.len() as u64;
        Ok(())
    }

    fn seal_current(&mut self) -> Result<()> {
        let builder = std::mem::replace(
            &mut self.builder,
            PackfileBuilder::new(self.state_id, self.timestamp),
        );
        let (packfile_mac, bytes, footer) = builder.finish(&self.repo.object_key())?;
        self.repo.put_packfile(packfile_mac, &bytes)?;

        for entry in &footer.index {
            self.state.put_delta(DeltaEntry {
                etype: entry.etype,
                version: entry.version,
                mac: entry.mac,
                packfile: packfile_mac,
                offset: entry.offset,
                length: entry.length,
            });
        }
        self.state.put_packfile(self.state_id, packfile_mac);
        Ok(())
    }

    /// Seal the open packfile, publish the session state and fold it into
    /// the repository's coalesced view.
    fn commit(mut self) -> Result<(Mac, u64)> {
        if !self.builder.is_empty() {
            self.seal_current()?;
        }

        let mut serialized = Vec::new();
        self.state.serialize_to_stream(&mut serialized)?;
        self.repo.put_state(self.state_id, &serialized)?;
        self.repo.absorb_state(self.state_id, &self.state)?;
        Ok((self.state_id, self.bytes_stored))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| CoffreError::Config(format!("bad exclude pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CoffreError::Config(format!("exclude patterns: {e}")))
}

fn random_mac() -> Mac {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Mac(bytes)
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o644
}
