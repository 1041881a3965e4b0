//! Reconstruction of missing remote state files from packfile footers.
//!
//! Packfiles record the state they were committed under; a state file
//! lost from storage can therefore be rebuilt by regrouping the
//! surviving packfiles by state id and replaying their indices.

use std::collections::{BTreeMap, BTreeSet};

use coffre_types::{Mac, Result};

use crate::repo::state::{DeltaEntry, LocalState};
use crate::repo::{now_nanos, Repository};

/// Repair missing remote states. With `apply == false` only reports what
/// would be rebuilt. Returns the orphaned state ids, in storage order.
///
/// Idempotent: once a reconstructed state is published its id appears in
/// `get_states()`, so a second run finds no orphans.
pub fn run(repo: &Repository, apply: bool) -> Result<Vec<Mac>> {
    let remote_states: BTreeSet<Mac> = repo.get_states()?.into_iter().collect();

    let mut orphans: BTreeMap<Mac, Vec<Mac>> = BTreeMap::new();
    for entry in repo.list_packfile_entries()? {
        if remote_states.contains(&entry.state_id) {
            continue;
        }
        orphans
            .entry(entry.state_id)
            .or_default()
            .push(entry.packfile);
    }

    let orphan_ids: Vec<Mac> = orphans.keys().copied().collect();

    if !apply {
        for state_id in &orphan_ids {
            tracing::info!("missing remote state {state_id}");
        }
        if !orphan_ids.is_empty() {
            tracing::info!(
                "{} missing state(s) found; re-run with -apply to rebuild them",
                orphan_ids.len()
            );
        }
        return Ok(orphan_ids);
    }

    for (state_id, packfiles) in orphans {
        tracing::info!("repairing missing remote state {state_id}");

        // Scan cache for this state id: skips a packfile that shows up
        // more than once in the group.
        let mut scanned: BTreeSet<Mac> = BTreeSet::new();
        let mut delta_state = LocalState::new(now_nanos());

        for packfile_mac in packfiles {
            if !scanned.insert(packfile_mac) {
                continue;
            }

            let packfile = repo.get_packfile(packfile_mac)?;
            delta_state.observe_timestamp(packfile.footer.timestamp);

            for entry in &packfile.footer.index {
                delta_state.put_delta(DeltaEntry {
                    etype: entry.etype,
                    version: entry.version,
                    mac: entry.mac,
                    packfile: packfile_mac,
                    offset: entry.offset,
                    length: entry.length,
                });
            }
            delta_state.put_packfile(state_id, packfile_mac);
        }

        let mut serialized = Vec::new();
        delta_state.serialize_to_stream(&mut serialized)?;
        repo.put_state(state_id, &serialized)?;
    }

    Ok(orphan_ids)
}
