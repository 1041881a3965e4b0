use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use chrono::Utc;

use crate::cached;
use crate::commands::{self, backup, check, maintenance, restore, rm, sync};
use crate::config::{
    parse_human_duration, BackupTaskConfig, CheckTaskConfig, MaintenanceTaskConfig,
    RestoreTaskConfig, SyncTaskConfig,
};
use crate::hooks::{run_hook, HookContext};
use crate::storage;

use super::{client_ctx, make_repository, sleep_tick, SchedulerCtx};

pub(super) fn backup_task(
    ctx: &SchedulerCtx,
    name: &str,
    repository: &str,
    task: &BackupTaskConfig,
) {
    let interval = match parse_human_duration(&task.interval) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(task = name, "invalid backup interval: {e}");
            return;
        }
    };
    let retention = match &task.retention {
        Some(r) => match parse_human_duration(r) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::error!(task = name, "invalid retention: {e}");
                return;
            }
        },
        None => None,
    };

    loop {
        if !sleep_tick(ctx, interval) {
            return;
        }

        let mut excludes = Vec::new();
        if let Some(ignore_file) = &task.ignore_file {
            match commands::load_ignore_file(Path::new(ignore_file)) {
                Ok(lines) => excludes.extend(lines),
                Err(e) => {
                    tracing::error!(task = name, "failed to load ignore file: {e}");
                    continue;
                }
            }
        }
        excludes.extend(task.ignore.iter().cloned());

        let store_config = match ctx.config.resolve_repository(repository) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(task = name, "error getting repository config: {e}");
                continue;
            }
        };
        let (repo, secret) = match make_repository(ctx, &store_config) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(task = name, "error opening repository: {e}");
                continue;
            }
        };
        let client = client_ctx(ctx, &secret);
        let repo_id = repo.configuration().repository_id;

        if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
            tracing::error!(task = name, "error refreshing state: {e}");
            continue;
        }

        let hook_ctx = HookContext {
            job: name,
            repository,
            error: None,
        };
        if let Some(pre) = &task.pre_hook {
            if let Err(e) = run_hook(pre, &hook_ctx) {
                tracing::error!(task = name, "pre-hook failed, skipping backup: {e}");
                continue;
            }
        }

        let opts = backup::BackupOptions {
            job: name.to_string(),
            tags: task.tags.clone(),
            excludes: excludes.clone(),
        };
        let outcome = backup::run(
            &repo,
            Path::new(&task.path),
            &opts,
            ctx.events.as_ref(),
        );

        if let Err(e) = outcome {
            tracing::error!(task = name, "error creating backup: {e}");
            run_fail_hook(task, name, repository, &e.to_string());
            continue;
        }

        // A failed integrity check is a failed backup: the post-hook
        // only runs once the check (when enabled) has passed.
        if task.check {
            if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
                tracing::error!(task = name, "error refreshing state: {e}");
                continue;
            }
            let check_opts = check::CheckOptions {
                latest: false,
                path: None,
                job: Some(name.to_string()),
            };
            if let Err(e) = check::run(&repo, &check_opts) {
                tracing::error!(task = name, "post-backup check failed: {e}");
                run_fail_hook(task, name, repository, &e.to_string());
                continue;
            }
        }

        if let Some(post) = &task.post_hook {
            if let Err(e) = run_hook(post, &hook_ctx) {
                tracing::warn!(task = name, "post-hook failed: {e}");
            }
        }

        if let Some(retention) = retention {
            if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
                tracing::error!(task = name, "error refreshing state: {e}");
                continue;
            }
            let before = Utc::now()
                - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
            let rm_opts = rm::RmOptions {
                job: Some(name.to_string()),
                before: Some(before),
                apply: true,
            };
            match rm::run(&repo, &rm_opts) {
                Ok(_) => tracing::info!(task = name, "retention purge succeeded"),
                Err(e) => {
                    tracing::error!(task = name, "error removing obsolete backups: {e}");
                    continue;
                }
            }
        }
    }
}

fn run_fail_hook(task: &BackupTaskConfig, name: &str, repository: &str, error: &str) {
    if let Some(fail) = &task.fail_hook {
        let hook_ctx = HookContext {
            job: name,
            repository,
            error: Some(error),
        };
        if let Err(e) = run_hook(fail, &hook_ctx) {
            tracing::warn!(task = name, "fail-hook failed: {e}");
        }
    }
}

pub(super) fn check_task(ctx: &SchedulerCtx, name: &str, repository: &str, task: &CheckTaskConfig) {
    let interval = match parse_human_duration(&task.interval) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(task = name, "invalid check interval: {e}");
            return;
        }
    };

    loop {
        if !sleep_tick(ctx, interval) {
            return;
        }

        let Some((repo, client, store_config)) = open_for_tick(ctx, name, repository) else {
            continue;
        };
        let repo_id = repo.configuration().repository_id;
        if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
            tracing::error!(task = name, "error refreshing state: {e}");
            continue;
        }

        let opts = check::CheckOptions {
            latest: task.latest,
            path: task.path.clone(),
            job: Some(name.to_string()),
        };
        match check::run(&repo, &opts) {
            Ok(report) => tracing::info!(
                task = name,
                snapshots = report.snapshots_checked,
                chunks = report.chunks_verified,
                "check finished"
            ),
            Err(e) => {
                tracing::error!(task = name, "error executing check: {e}");
                continue;
            }
        }
    }
}

pub(super) fn restore_task(
    ctx: &SchedulerCtx,
    name: &str,
    repository: &str,
    task: &RestoreTaskConfig,
) {
    let interval = match parse_human_duration(&task.interval) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(task = name, "invalid restore interval: {e}");
            return;
        }
    };

    loop {
        if !sleep_tick(ctx, interval) {
            return;
        }

        let Some((repo, client, store_config)) = open_for_tick(ctx, name, repository) else {
            continue;
        };
        let repo_id = repo.configuration().repository_id;
        if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
            tracing::error!(task = name, "error refreshing state: {e}");
            continue;
        }

        let opts = restore::RestoreOptions {
            target: PathBuf::from(&task.target),
            snapshot: None,
            path: task.path.clone(),
            job: Some(name.to_string()),
        };
        if let Err(e) = restore::run(&repo, &opts) {
            tracing::error!(task = name, "error executing restore: {e}");
            continue;
        }
    }
}

pub(super) fn sync_task(ctx: &SchedulerCtx, name: &str, repository: &str, task: &SyncTaskConfig) {
    let interval = match parse_human_duration(&task.interval) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(task = name, "invalid sync interval: {e}");
            return;
        }
    };
    match task.direction.as_str() {
        "to" | "from" | "with" => {}
        other => {
            tracing::error!(task = name, "invalid sync direction: {other}");
            ctx.shutdown.store(true, Ordering::SeqCst);
            return;
        }
    }

    loop {
        if !sleep_tick(ctx, interval) {
            return;
        }

        let Some((repo, client, store_config)) = open_for_tick(ctx, name, repository) else {
            continue;
        };
        let repo_id = repo.configuration().repository_id;
        if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
            tracing::error!(task = name, "error refreshing state: {e}");
            continue;
        }

        let peer_config = match ctx.config.resolve_repository(&task.peer) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(task = name, "error getting peer config: {e}");
                continue;
            }
        };
        let peer = match storage::backend_for(&peer_config) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(task = name, "error opening peer store: {e}");
                continue;
            }
        };

        if let Err(e) = sync::run(&repo, peer.as_ref(), &task.direction) {
            tracing::error!(task = name, "error executing sync: {e}");
            continue;
        }
    }
}

pub(super) fn maintenance_task(ctx: &SchedulerCtx, task: &MaintenanceTaskConfig) {
    let interval = match parse_human_duration(&task.interval) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("invalid maintenance interval: {e}");
            return;
        }
    };
    let retention = match &task.retention {
        Some(r) => match parse_human_duration(r) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::error!("invalid maintenance retention: {e}");
                return;
            }
        },
        None => None,
    };

    loop {
        if !sleep_tick(ctx, interval) {
            return;
        }

        let Some((repo, client, store_config)) =
            open_for_tick(ctx, "maintenance", &task.repository)
        else {
            continue;
        };
        let repo_id = repo.configuration().repository_id;
        if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
            tracing::error!("error refreshing state: {e}");
            continue;
        }

        match maintenance::run(&repo) {
            Ok(_) => {
                tracing::info!("maintenance of repository {} succeeded", task.repository)
            }
            Err(e) => {
                tracing::error!("error executing maintenance: {e}");
                continue;
            }
        }

        if let Some(retention) = retention {
            if let Err(e) = cached::rebuild_state_from_cached(&client, repo_id, &store_config) {
                tracing::error!("error refreshing state: {e}");
                continue;
            }
            let before = Utc::now()
                - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
            let rm_opts = rm::RmOptions {
                job: Some("maintenance".to_string()),
                before: Some(before),
                apply: true,
            };
            match rm::run(&repo, &rm_opts) {
                Ok(_) => tracing::info!("retention purge succeeded"),
                Err(e) => {
                    tracing::error!("error removing obsolete backups: {e}");
                    continue;
                }
            }
        }
    }
}

/// Shared per-tick preamble: resolve the store config and open the
/// repository. Logs and returns `None` on failure so the task skips to
/// its next tick.
fn open_for_tick(
    ctx: &SchedulerCtx,
    name: &str,
    repository: &str,
) -> Option<(
    crate::repo::Repository,
    crate::cached::ClientCtx,
    crate::storage::StoreConfig,
)> {
    let store_config = match ctx.config.resolve_repository(repository) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(task = name, "error getting repository config: {e}");
            return None;
        }
    };
    match make_repository(ctx, &store_config) {
        Ok((repo, secret)) => {
            let client = client_ctx(ctx, &secret);
            Some((repo, client, store_config))
        }
        Err(e) => {
            tracing::error!(task = name, "error opening repository: {e}");
            None
        }
    }
}
