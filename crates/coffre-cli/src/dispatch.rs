use std::path::{Path, PathBuf};

use coffre_core::config::Config;
use coffre_core::platform::paths;
use coffre_core::repo::{resolve_secret, Configuration, Repository};
use coffre_core::storage::{self, StoreConfig};
use coffre_types::Result;

use crate::cli::{Cli, Commands};
use crate::cmd;

pub(crate) fn run(cli: Cli) -> Result<i32> {
    let config_path = config_path(cli.config.as_deref());

    match cli.command {
        Commands::Cached {
            foreground,
            log,
            teardown,
        } => cmd::cached::run(foreground, log.as_deref(), &teardown),
        Commands::Scheduler { key_file } => {
            let config = Config::load(&config_path)?;
            cmd::scheduler::run(config, key_file.as_deref())
        }
        Commands::Repair { repo, apply } => {
            let config = load_config_or_default(&config_path);
            cmd::repair::run(&config, &repo, apply)
        }
        Commands::Mount { repo, to } => {
            let config = load_config_or_default(&config_path);
            cmd::mount::run(&config, &repo, &to)
        }
        Commands::Init { repo } => {
            let config = load_config_or_default(&config_path);
            cmd::init::run(&config, &repo)
        }
        Commands::Backup {
            repo,
            job,
            tags,
            excludes,
            path,
        } => {
            let config = load_config_or_default(&config_path);
            cmd::backup::run(&config, &repo, &job, tags, excludes, Path::new(&path))
        }
    }
}

fn config_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("COFFRE_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    paths::config_file()
}

/// Commands that can work from a bare locator fall back to an empty
/// document when no configuration file exists.
fn load_config_or_default(path: &Path) -> Config {
    if path.exists() {
        match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("ignoring unreadable configuration: {e}");
                Config::default()
            }
        }
    } else {
        Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(config_path(Some("/etc/custom.yaml")), PathBuf::from("/etc/custom.yaml"));
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.yaml"));
        assert!(config.tasks.is_empty());
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn config_file_is_loaded_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "repositories:\n  nas:\n    location: \"fs:///backups\"\n",
        )
        .unwrap();
        let config = load_config_or_default(&path);
        assert_eq!(config.repositories.len(), 1);
    }
}

/// Open a repository (no local rebuild) with its secret resolved from
/// the store configuration.
pub(crate) fn open_repository(
    config: &Config,
    reference: &str,
) -> Result<(Repository, StoreConfig, Vec<u8>)> {
    let store_config = config.resolve_repository(reference)?;
    let (store, serialized) = storage::open_store(&store_config)?;
    let configuration = Configuration::from_wrapped_bytes(&serialized)?;
    let secret = resolve_secret(&configuration, &store_config, &[])?;
    let secret_bytes = secret.as_ref().map(|s| s.to_vec()).unwrap_or_default();
    let repo = Repository::open_no_rebuild(store, &serialized, secret, &paths::cache_dir())?;
    Ok((repo, store_config, secret_bytes))
}
