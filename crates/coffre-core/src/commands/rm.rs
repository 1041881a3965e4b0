use chrono::{DateTime, Utc};
use rand::RngCore;

use coffre_types::{Mac, Result};

use crate::repo::state::{DeltaEntry, LocalState};
use crate::repo::{now_nanos, BlobType, Repository};

pub struct RmOptions {
    /// Restrict to snapshots committed by this job.
    pub job: Option<String>,
    /// Only remove snapshots strictly older than this instant.
    pub before: Option<DateTime<Utc>>,
    /// Without apply, only report what would be removed.
    pub apply: bool,
}

/// Remove matching snapshots by publishing tombstone records. The
/// underlying packfiles stay in place until maintenance reclaims them.
/// Returns the removed snapshot ids.
pub fn run(repo: &Repository, opts: &RmOptions) -> Result<Vec<Mac>> {
    let mut victims = Vec::new();
    for snapshot_id in repo.locate_snapshot_ids() {
        let header = repo.load_snapshot(snapshot_id)?.header;
        if let Some(job) = &opts.job {
            if &header.job != job {
                continue;
            }
        }
        if let Some(before) = opts.before {
            if header.timestamp >= before {
                continue;
            }
        }
        victims.push(snapshot_id);
    }

    if victims.is_empty() {
        return Ok(victims);
    }
    if !opts.apply {
        for id in &victims {
            tracing::info!("would remove snapshot {}", id.short_hex());
        }
        return Ok(victims);
    }

    let mut tombstones = LocalState::new(now_nanos());
    for id in &victims {
        tombstones.put_delta(DeltaEntry {
            etype: BlobType::SnapshotTombstone,
            version: crate::repo::packfile::PACKFILE_VERSION,
            mac: *id,
            packfile: Mac::ZERO,
            offset: 0,
            length: 0,
        });
    }

    let mut serialized = Vec::new();
    tombstones.serialize_to_stream(&mut serialized)?;

    let mut state_id_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut state_id_bytes);
    let state_id = Mac(state_id_bytes);

    repo.put_state(state_id, &serialized)?;
    repo.absorb_state(state_id, &tombstones)?;

    for id in &victims {
        tracing::info!("removed snapshot {}", id.short_hex());
    }
    Ok(victims)
}
