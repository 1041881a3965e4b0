use coffre_core::config::Config;
use coffre_core::crypto;
use coffre_core::platform::{paths, shell};
use coffre_core::repo::Repository;
use coffre_core::storage::{self, Store};
use coffre_types::{CoffreError, Result};

pub(crate) fn run(config: &Config, repo_ref: &str) -> Result<i32> {
    let store_config = config.resolve_repository(repo_ref)?;
    let store = storage::backend_for(&store_config)?;

    let encryption = match passphrase_from(&store_config)? {
        Some(passphrase) => Some(crypto::new_encryption_block(passphrase.as_bytes())?),
        None => None,
    };
    let encrypted = encryption.is_some();

    let repo = Repository::init(store, encryption, &paths::cache_dir())?;
    tracing::info!(
        repo = %repo.configuration().repository_id,
        encrypted,
        "repository created at {}",
        repo.store().location()
    );
    Ok(0)
}

fn passphrase_from(store_config: &storage::StoreConfig) -> Result<Option<String>> {
    if let Some(passphrase) = store_config.get("passphrase") {
        return Ok(Some(passphrase.clone()));
    }
    if let Some(cmd) = store_config.get("passphrase_cmd") {
        let output = shell::run_script_with_timeout(cmd, std::time::Duration::from_secs(60))?;
        if !output.status.success() {
            return Err(CoffreError::Config(format!(
                "passphrase_cmd failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let passphrase = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if passphrase.is_empty() {
            return Err(CoffreError::Config(
                "passphrase_cmd returned an empty passphrase".into(),
            ));
        }
        return Ok(Some(passphrase));
    }
    Ok(None)
}
