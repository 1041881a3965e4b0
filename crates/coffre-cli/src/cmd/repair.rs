use coffre_core::config::Config;
use coffre_core::repair;
use coffre_types::Result;

use crate::dispatch::open_repository;

pub(crate) fn run(config: &Config, repo_ref: &str, apply: bool) -> Result<i32> {
    let (repo, _store_config, _secret) = open_repository(config, repo_ref)?;

    let orphans = repair::run(&repo, apply)?;
    if orphans.is_empty() {
        tracing::info!("no missing remote states");
    } else if apply {
        tracing::info!("rebuilt {} remote state(s)", orphans.len());
    }
    Ok(0)
}
