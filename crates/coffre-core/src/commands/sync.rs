use std::collections::BTreeSet;

use coffre_protocol::ResourceKind;
use coffre_types::{CoffreError, Result};

use crate::repo::Repository;
use crate::storage::Store;

/// Resource kinds replicated between peers. Locks are host-local and ECC
/// resources follow their primaries.
const SYNCED_KINDS: [ResourceKind; 4] = [
    ResourceKind::Packfile,
    ResourceKind::State,
    ResourceKind::EccPackfile,
    ResourceKind::EccState,
];

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pushed: u64,
    pub pulled: u64,
}

/// Synchronize resources with a peer store.
///
/// `direction` is forwarded verbatim from the configuration: `to` pushes
/// missing resources to the peer, `from` pulls them, `with` does both.
pub fn run(repo: &Repository, peer: &dyn Store, direction: &str) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    match direction {
        "to" => stats.pushed = copy_missing(repo.store(), peer)?,
        "from" => stats.pulled = copy_missing(peer, repo.store())?,
        "with" => {
            stats.pushed = copy_missing(repo.store(), peer)?;
            stats.pulled = copy_missing(peer, repo.store())?;
        }
        other => {
            return Err(CoffreError::Config(format!(
                "invalid sync direction: {other}"
            )))
        }
    }
    tracing::info!(
        direction,
        pushed = stats.pushed,
        pulled = stats.pulled,
        "sync: synchronization succeeded"
    );
    Ok(stats)
}

fn copy_missing(src: &dyn Store, dst: &dyn Store) -> Result<u64> {
    let mut copied = 0u64;
    for kind in SYNCED_KINDS {
        let present: BTreeSet<_> = dst.list(kind)?.into_iter().collect();
        for mac in src.list(kind)? {
            if present.contains(&mac) {
                continue;
            }
            let data = src.get(kind, mac, None)?;
            dst.put(kind, mac, &data)?;
            copied += 1;
        }
    }
    Ok(copied)
}
