use std::path::Path;

use coffre_core::cached::{self, ClientCtx};
use coffre_core::commands::backup;
use coffre_core::config::Config;
use coffre_core::platform::paths;
use coffre_types::Result;

use crate::dispatch::open_repository;
use crate::signal;

pub(crate) fn run(
    config: &Config,
    repo_ref: &str,
    job: &str,
    tags: Vec<String>,
    excludes: Vec<String>,
    path: &Path,
) -> Result<i32> {
    let (repo, store_config, secret) = open_repository(config, repo_ref)?;
    let repo_id = repo.configuration().repository_id;

    // Refresh the coalesced state first so the backup deduplicates
    // against everything already committed.
    let client = ClientCtx::new(paths::cache_dir())
        .with_secret(secret)
        .with_shutdown(signal::shutdown_flag());
    cached::rebuild_state_from_cached(&client, repo_id, &store_config)?;
    repo.reload_state_cache()?;

    let outcome = backup::run(
        &repo,
        path,
        &backup::BackupOptions {
            job: job.to_string(),
            tags,
            excludes,
        },
        None,
    )?;

    println!("{}", outcome.snapshot_id.short_hex());
    Ok(0)
}
