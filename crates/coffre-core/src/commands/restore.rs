use std::fs;
use std::path::{Path, PathBuf};

use coffre_types::{CoffreError, Mac, Result};

use crate::repo::Repository;
use crate::snapshot::ItemKind;

pub struct RestoreOptions {
    pub target: PathBuf,
    /// Restore a specific snapshot; default is the most recent one.
    pub snapshot: Option<Mac>,
    /// Restrict to items under this path.
    pub path: Option<String>,
    /// When picking the most recent snapshot, restrict to this job.
    pub job: Option<String>,
}

/// Extract a snapshot into the target directory. Returns the number of
/// items written.
pub fn run(repo: &Repository, opts: &RestoreOptions) -> Result<u64> {
    let snapshot_id = match opts.snapshot {
        Some(id) => id,
        None => latest_snapshot(repo, opts.job.as_deref())?,
    };
    let snapshot = repo.load_snapshot(snapshot_id)?;

    fs::create_dir_all(&opts.target)?;
    let mut written = 0u64;

    for item in &snapshot.items {
        if item.path.is_empty() {
            continue;
        }
        if let Some(prefix) = &opts.path {
            if !super::check::item_under(&item.path, prefix) {
                continue;
            }
        }

        let dest = sanitized_join(&opts.target, &item.path)?;
        match item.kind {
            ItemKind::Directory => {
                fs::create_dir_all(&dest)?;
                set_mode(&dest, item.mode);
            }
            ItemKind::File => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut data = Vec::with_capacity(item.size as usize);
                for chunk in &item.chunks {
                    data.extend_from_slice(&repo.read_blob(chunk.mac)?);
                }
                fs::write(&dest, data)?;
                set_mode(&dest, item.mode);
            }
            ItemKind::Symlink => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let target = item
                    .link_target
                    .as_deref()
                    .ok_or_else(|| {
                        CoffreError::InvalidFormat(format!("symlink '{}' has no target", item.path))
                    })?;
                let _ = fs::remove_file(&dest);
                std::os::unix::fs::symlink(target, &dest)?;
            }
        }
        written += 1;
    }

    tracing::info!(
        snapshot = %snapshot_id.short_hex(),
        items = written,
        target = %opts.target.display(),
        "restore finished"
    );
    Ok(written)
}

/// The most recent live snapshot, optionally restricted to one job.
pub fn latest_snapshot(repo: &Repository, job: Option<&str>) -> Result<Mac> {
    let mut best: Option<(chrono::DateTime<chrono::Utc>, Mac)> = None;
    for snapshot_id in repo.locate_snapshot_ids() {
        let header = repo.load_snapshot(snapshot_id)?.header;
        if let Some(job) = job {
            if header.job != job {
                continue;
            }
        }
        if best.map(|(ts, _)| header.timestamp > ts).unwrap_or(true) {
            best = Some((header.timestamp, snapshot_id));
        }
    }
    best.map(|(_, id)| id)
        .ok_or_else(|| CoffreError::SnapshotNotFound("no matching snapshot".into()))
}

/// Join a snapshot-relative path under `target`, rejecting traversal.
fn sanitized_join(target: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = target.to_path_buf();
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(CoffreError::InvalidFormat(format!(
                "unsafe path in snapshot: '{rel}'"
            )));
        }
        out.push(part);
    }
    Ok(out)
}

fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
}
