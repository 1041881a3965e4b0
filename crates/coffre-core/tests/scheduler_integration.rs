//! Scheduler end-to-end: a backup task ticking against a live cached
//! daemon and a mock-backed repository.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coffre_core::cached::daemon::Cached;
use coffre_core::config::{BackupTaskConfig, Config, TaskSet};
use coffre_core::repo::Repository;
use coffre_core::scheduler::{Scheduler, SchedulerCtx};
use coffre_core::storage::mock_backend::MockStore;
use coffre_core::storage::{store_config_from_location, Store};
use coffre_protocol::ResourceKind;

fn wait_for_socket(cache_dir: &Path) {
    let socket = coffre_core::cached::socket_path(cache_dir);
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if socket.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("daemon did not come up");
}

#[test]
fn backup_task_commits_snapshots() {
    let store_name = "sched-backup";
    MockStore::reset(store_name);
    let cache = tempfile::tempdir().unwrap();
    let store = Box::new(MockStore::shared(store_name));
    Repository::init(store, None, cache.path()).unwrap();

    let daemon = Cached::new(cache.path(), Duration::from_secs(60));
    let daemon_shutdown = Arc::new(AtomicBool::new(false));
    let daemon_flag = Arc::clone(&daemon_shutdown);
    let daemon_handle = std::thread::spawn(move || daemon.listen_and_serve(daemon_flag));
    wait_for_socket(cache.path());

    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("a.txt"), b"scheduled content").unwrap();
    std::fs::write(source.path().join("skip.tmp"), b"excluded").unwrap();

    let mut config = Config::default();
    config.repositories.insert(
        "primary".to_string(),
        store_config_from_location(&format!("mock://{store_name}")),
    );
    config.tasks.push(TaskSet {
        name: "nightly".to_string(),
        repository: "@primary".to_string(),
        backup: Some(BackupTaskConfig {
            interval: "1s".to_string(),
            path: source.path().to_string_lossy().into_owned(),
            tags: vec!["nightly".to_string()],
            ignore_file: None,
            ignore: vec!["*.tmp".to_string()],
            pre_hook: None,
            post_hook: None,
            fail_hook: None,
            check: true,
            retention: None,
        }),
        check: None,
        restore: None,
        sync: None,
        maintenance: None,
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let scheduler = Scheduler::new(SchedulerCtx {
        config,
        cache_dir: cache.path().to_path_buf(),
        key_from_file: None,
        shutdown: Arc::clone(&shutdown),
        events: None,
    });
    let scheduler_handle = std::thread::spawn(move || scheduler.run());

    // Wait for the first tick to commit a snapshot.
    let store = MockStore::shared(store_name);
    let deadline = Instant::now() + Duration::from_secs(15);
    while store.list(ResourceKind::Packfile).unwrap().is_empty() {
        assert!(Instant::now() < deadline, "no snapshot was committed");
        std::thread::sleep(Duration::from_millis(50));
    }

    shutdown.store(true, Ordering::SeqCst);
    scheduler_handle.join().unwrap().unwrap();

    // The committed snapshot honors the exclude list.
    let verify_cache = tempfile::tempdir().unwrap();
    let store = Box::new(MockStore::shared(store_name));
    let serialized = store.open().unwrap();
    let repo = Repository::open_no_rebuild(store, &serialized, None, verify_cache.path()).unwrap();
    repo.rebuild_state().unwrap();

    let snapshots = repo.locate_snapshot_ids();
    assert!(!snapshots.is_empty());
    let snapshot = repo.load_snapshot(snapshots[0]).unwrap();
    assert_eq!(snapshot.header.job, "nightly");
    assert_eq!(snapshot.header.tags, vec!["nightly".to_string()]);
    assert!(snapshot.item("a.txt").is_some());
    assert!(snapshot.item("skip.tmp").is_none());

    daemon_shutdown.store(true, Ordering::SeqCst);
    daemon_handle.join().unwrap().unwrap();
}
