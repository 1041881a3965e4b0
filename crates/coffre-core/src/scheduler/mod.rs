//! Long-running supervisor of periodic tasks. Each configured sub-task
//! (backup, check, restore, sync, maintenance) runs in its own thread
//! with private state; every tick goes through the cached daemon for a
//! state refresh before the task command runs.

mod tasks;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use coffre_types::{CoffreError, Result};

use crate::cached::ClientCtx;
use crate::config::Config;
use crate::crypto;
use crate::events::EventBus;
use crate::repo::{Configuration, Repository};
use crate::storage::{self, StoreConfig};

pub struct SchedulerCtx {
    pub config: Config,
    pub cache_dir: PathBuf,
    /// Key material loaded from a file for unattended encrypted repos.
    pub key_from_file: Option<String>,
    pub shutdown: Arc<AtomicBool>,
    pub events: Option<EventBus>,
}

pub struct Scheduler {
    ctx: Arc<SchedulerCtx>,
}

impl Scheduler {
    pub fn new(ctx: SchedulerCtx) -> Scheduler {
        Scheduler { ctx: Arc::new(ctx) }
    }

    /// Spawn every configured sub-task and block until all of them exit
    /// (which they do once the shutdown flag is raised).
    pub fn run(&self) -> Result<()> {
        let mut handles = Vec::new();

        for taskset in &self.ctx.config.tasks {
            if let Some(task) = &taskset.backup {
                let ctx = Arc::clone(&self.ctx);
                let name = taskset.name.clone();
                let repository = taskset.repository.clone();
                let task = task.clone();
                handles.push(std::thread::spawn(move || {
                    tasks::backup_task(&ctx, &name, &repository, &task)
                }));
            }
            if let Some(task) = &taskset.check {
                let ctx = Arc::clone(&self.ctx);
                let name = taskset.name.clone();
                let repository = taskset.repository.clone();
                let task = task.clone();
                handles.push(std::thread::spawn(move || {
                    tasks::check_task(&ctx, &name, &repository, &task)
                }));
            }
            if let Some(task) = &taskset.restore {
                let ctx = Arc::clone(&self.ctx);
                let name = taskset.name.clone();
                let repository = taskset.repository.clone();
                let task = task.clone();
                handles.push(std::thread::spawn(move || {
                    tasks::restore_task(&ctx, &name, &repository, &task)
                }));
            }
            if let Some(task) = &taskset.sync {
                let ctx = Arc::clone(&self.ctx);
                let name = taskset.name.clone();
                let repository = taskset.repository.clone();
                let task = task.clone();
                handles.push(std::thread::spawn(move || {
                    tasks::sync_task(&ctx, &name, &repository, &task)
                }));
            }
            if let Some(task) = &taskset.maintenance {
                let ctx = Arc::clone(&self.ctx);
                let task = task.clone();
                handles.push(std::thread::spawn(move || {
                    tasks::maintenance_task(&ctx, &task)
                }));
            }
        }

        tracing::info!(tasks = handles.len(), "scheduler started");
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

/// Sleep one task interval, waking early on shutdown. Returns false when
/// the task should exit.
pub(crate) fn sleep_tick(ctx: &SchedulerCtx, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if ctx.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(250).min(interval));
    }
    !ctx.shutdown.load(Ordering::SeqCst)
}

/// Open the repository without a local rebuild; the actual rebuild is
/// done by cached.
pub(crate) fn make_repository(
    ctx: &SchedulerCtx,
    store_config: &StoreConfig,
) -> Result<(Repository, Vec<u8>)> {
    let (store, serialized) = storage::open_store(store_config)?;
    let configuration = Configuration::from_wrapped_bytes(&serialized)?;
    let secret = setup_encryption(ctx, &configuration)?;
    let secret_bytes = secret.as_ref().map(|s| s.to_vec()).unwrap_or_default();
    let repo = Repository::open_no_rebuild(store, &serialized, secret, &ctx.cache_dir)?;
    Ok((repo, secret_bytes))
}

fn setup_encryption(
    ctx: &SchedulerCtx,
    configuration: &Configuration,
) -> Result<Option<Zeroizing<[u8; 32]>>> {
    let encryption = match &configuration.encryption {
        None => return Ok(None),
        Some(block) => block,
    };

    match &ctx.key_from_file {
        Some(secret) => {
            let key = crypto::derive_key(&encryption.kdf, secret.as_bytes())?;
            if !crypto::verify_canary(encryption, &key) {
                return Err(CoffreError::CantUnlock);
            }
            Ok(Some(key))
        }
        None => Err(CoffreError::CantUnlock),
    }
}

/// Client context for daemon calls made on behalf of a task.
pub(crate) fn client_ctx(ctx: &SchedulerCtx, secret: &[u8]) -> ClientCtx {
    ClientCtx::new(ctx.cache_dir.clone())
        .with_secret(secret.to_vec())
        .with_shutdown(Arc::clone(&ctx.shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(shutdown: Arc<AtomicBool>) -> SchedulerCtx {
        SchedulerCtx {
            config: Config::default(),
            cache_dir: std::env::temp_dir(),
            key_from_file: None,
            shutdown,
            events: None,
        }
    }

    #[test]
    fn sleep_tick_exits_on_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = test_ctx(Arc::clone(&shutdown));
        shutdown.store(true, Ordering::SeqCst);
        assert!(!sleep_tick(&ctx, Duration::from_secs(60)));
    }

    #[test]
    fn sleep_tick_completes_short_intervals() {
        let ctx = test_ctx(Arc::new(AtomicBool::new(false)));
        assert!(sleep_tick(&ctx, Duration::from_millis(5)));
    }

    #[test]
    fn encrypted_repo_without_key_source_cant_unlock() {
        let ctx = test_ctx(Arc::new(AtomicBool::new(false)));
        let block = crypto::new_encryption_block(b"pw").unwrap();
        let configuration = Configuration::new(Some(block));
        assert!(matches!(
            setup_encryption(&ctx, &configuration),
            Err(CoffreError::CantUnlock)
        ));
    }

    #[test]
    fn wrong_key_from_file_cant_unlock() {
        let mut ctx = test_ctx(Arc::new(AtomicBool::new(false)));
        ctx.key_from_file = Some("wrong".into());
        let block = crypto::new_encryption_block(b"right").unwrap();
        let configuration = Configuration::new(Some(block));
        assert!(matches!(
            setup_encryption(&ctx, &configuration),
            Err(CoffreError::CantUnlock)
        ));
    }

    #[test]
    fn right_key_from_file_unlocks() {
        let mut ctx = test_ctx(Arc::new(AtomicBool::new(false)));
        ctx.key_from_file = Some("correct horse".into());
        let block = crypto::new_encryption_block(b"correct horse").unwrap();
        let configuration = Configuration::new(Some(block));
        assert!(setup_encryption(&ctx, &configuration).unwrap().is_some());
    }
}
