use std::sync::Arc;

use coffre_core::cached::{self, ClientCtx};
use coffre_core::config::Config;
use coffre_core::mount::{self, SnapshotFs};
use coffre_core::platform::paths;
use coffre_types::{CoffreError, Result};

use crate::dispatch::open_repository;
use crate::signal;

pub(crate) fn run(config: &Config, repo_ref: &str, to: &str) -> Result<i32> {
    if !to.starts_with("http://") {
        return Err(CoffreError::UnsupportedBackend(
            "FUSE mountpoints are not compiled in; use -to http://addr:port".into(),
        ));
    }

    let (repo, store_config, secret) = open_repository(config, repo_ref)?;
    let repo = Arc::new(repo);
    let repo_id = repo.configuration().repository_id;

    let client = ClientCtx::new(paths::cache_dir())
        .with_secret(secret)
        .with_shutdown(signal::shutdown_flag());

    // Root enumeration refreshes through the daemon, then picks up the
    // daemon's freshly persisted scan cache.
    let refresh_repo = Arc::clone(&repo);
    let fs = Arc::new(SnapshotFs::new(
        Arc::clone(&repo),
        Box::new(move || {
            cached::rebuild_state_from_cached(&client, repo_id, &store_config)?;
            refresh_repo.reload_state_cache()?;
            Ok(())
        }),
    ));

    mount::http::serve(fs, to, signal::shutdown_flag())?;
    Ok(0)
}
