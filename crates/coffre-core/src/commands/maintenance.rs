use std::collections::BTreeSet;

use coffre_protocol::ResourceKind;
use coffre_types::{Mac, Result};

use crate::repo::packfile::read_footer;
use crate::repo::state::LocalState;
use crate::repo::{BlobType, Repository};
use crate::storage::Store;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub packfiles_removed: u64,
    pub states_removed: u64,
}

/// Reclaim storage held only by tombstoned snapshots.
///
/// A packfile is removable when none of its blobs is reachable from a
/// live snapshot: every chunk unreferenced, every snapshot blob
/// tombstoned. State files whose packfiles have all been removed (and
/// whose tombstones point at snapshots that no longer exist) go with
/// them. Ends with a full state rebuild so the coalesced view matches
/// storage again.
pub fn run(repo: &Repository) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();

    // Reachable blobs: live snapshot ids plus every chunk they reference.
    let live_snapshots: BTreeSet<Mac> = repo.locate_snapshot_ids().into_iter().collect();
    let mut reachable: BTreeSet<Mac> = live_snapshots.clone();
    for snapshot_id in &live_snapshots {
        let snapshot = repo.load_snapshot(*snapshot_id)?;
        for item in &snapshot.items {
            for chunk in &item.chunks {
                reachable.insert(chunk.mac);
            }
        }
    }

    let mut removed_packfiles: BTreeSet<Mac> = BTreeSet::new();
    for packfile_mac in repo.store().list(ResourceKind::Packfile)? {
        let footer = read_footer(repo.store(), ResourceKind::Packfile, packfile_mac)?;
        let wanted = footer
            .index
            .iter()
            .any(|entry| reachable.contains(&entry.mac));
        if wanted {
            continue;
        }
        repo.delete_packfile(packfile_mac)?;
        removed_packfiles.insert(packfile_mac);
        report.packfiles_removed += 1;
        tracing::info!("reclaimed packfile {}", packfile_mac.short_hex());
    }

    // Drop state files that now describe nothing: every delta either
    // lives in a removed packfile, or is a tombstone for a snapshot blob
    // that is gone.
    if !removed_packfiles.is_empty() {
        for state_id in repo.get_states()? {
            let raw = repo.store().get(ResourceKind::State, state_id, None)?;
            let state = LocalState::from_stream(&raw)?;
            let obsolete = state.deltas().all(|delta| match delta.etype {
                // A tombstone is spent once the snapshot blob it hides is
                // itself gone from storage.
                BlobType::SnapshotTombstone => {
                    match repo.with_state(|s| s.lookup(delta.mac).copied()) {
                        None => true,
                        Some(entry) => removed_packfiles.contains(&entry.packfile),
                    }
                }
                _ => removed_packfiles.contains(&delta.packfile),
            });
            if obsolete && !state.is_empty() {
                repo.delete_state(state_id)?;
                report.states_removed += 1;
                tracing::info!("reclaimed state {}", state_id.short_hex());
            }
        }
    }

    repo.rebuild_state()?;
    Ok(report)
}
