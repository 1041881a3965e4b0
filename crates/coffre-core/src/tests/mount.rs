use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::commands::backup;
use crate::mount::{self, Node, SnapshotFs};
use crate::repo::Repository;
use crate::snapshot::ItemKind;
use crate::storage::Store;
use crate::testutil::{mock_repo, sample_tree};

fn mounted_fs(name: &str) -> (Arc<SnapshotFs>, Arc<AtomicU64>) {
    let test = mock_repo(name);
    let source = tempfile::tempdir().unwrap();
    sample_tree(source.path());
    backup::run(
        &test.repo,
        source.path(),
        &backup::BackupOptions {
            job: "mount".into(),
            tags: vec![],
            excludes: vec![],
        },
        None,
    )
    .unwrap();

    // Keep the scan-cache dir alive for the lifetime of the fs.
    let crate::testutil::TestRepo {
        repo: seed_repo,
        cache,
        store_name,
    } = test;
    drop(seed_repo);
    let cache = cache.keep();
    let store = Box::new(crate::storage::mock_backend::MockStore::shared(&store_name));
    let serialized = store.open().unwrap();
    let repo = Arc::new(Repository::open_no_rebuild(store, &serialized, None, &cache).unwrap());

    let refreshes = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&refreshes);
    let repo_for_refresh = Arc::clone(&repo);
    let fs = Arc::new(SnapshotFs::new(
        repo,
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            repo_for_refresh.rebuild_state()
        }),
    ));
    (fs, refreshes)
}

#[test]
fn root_lists_snapshots_with_short_names() {
    let (fs, _) = mounted_fs("mount-root");
    let entries = fs.root_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name.len(), 8);
    assert_eq!(entries[0].name, entries[0].snapshot_id.short_hex());
    assert!(entries[0].size > 0);
}

#[test]
fn root_refresh_is_rate_limited() {
    let (fs, refreshes) = mounted_fs("mount-ratelimit");
    fs.root_entries().unwrap();
    fs.root_entries().unwrap();
    fs.root_entries().unwrap();
    // Three enumerations within the window: one daemon-backed refresh.
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[test]
fn lookup_walks_the_tree() {
    let (fs, _) = mounted_fs("mount-lookup");
    let name = fs.root_entries().unwrap()[0].name.clone();
    let root = fs.lookup_snapshot(&name).unwrap();

    let mut names: Vec<String> = fs
        .read_dir(&root)
        .unwrap()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    names.sort();
    assert_eq!(names, vec!["data.bin", "docs", "hello.txt", "link"]);

    let docs = match fs.lookup(&root, "docs").unwrap() {
        Node::Dir(d) => d,
        other => panic!("docs should be a directory, got {other:?}"),
    };
    let children = fs.read_dir(&docs).unwrap();
    assert_eq!(children, vec![("notes.md".to_string(), ItemKind::File)]);
}

#[test]
fn lookup_is_cached_and_forgettable() {
    let (fs, _) = mounted_fs("mount-cache");
    let name = fs.root_entries().unwrap()[0].name.clone();
    let root = fs.lookup_snapshot(&name).unwrap();

    let first = fs.lookup(&root, "hello.txt").unwrap();
    let second = fs.lookup(&root, "hello.txt").unwrap();
    match (&first, &second) {
        (Node::File(a), Node::File(b)) => assert!(Arc::ptr_eq(a, b)),
        _ => panic!("expected file nodes"),
    }

    let before = fs.cached_nodes();
    fs.forget(first.key());
    assert_eq!(fs.cached_nodes(), before - 1);
}

#[test]
fn file_reads_by_range() {
    let (fs, _) = mounted_fs("mount-read");
    let name = fs.root_entries().unwrap()[0].name.clone();
    let root = fs.lookup_snapshot(&name).unwrap();
    let file = match fs.lookup(&root, "hello.txt").unwrap() {
        Node::File(f) => f,
        other => panic!("expected file, got {other:?}"),
    };

    let handle = fs.open(&file);
    assert_eq!(handle.read_at(0, 5).unwrap(), b"hello");
    assert_eq!(handle.read_at(6, 5).unwrap(), b"world");
    // Short read at EOF is normal.
    assert_eq!(handle.read_at(6, 100).unwrap(), b"world\n");
    assert!(handle.read_at(100, 10).unwrap().is_empty());
    assert_eq!(handle.read_all().unwrap(), b"hello world\n");
}

#[test]
fn symlink_nodes_expose_their_target() {
    let (fs, _) = mounted_fs("mount-symlink");
    let name = fs.root_entries().unwrap()[0].name.clone();
    let root = fs.lookup_snapshot(&name).unwrap();
    let link = match fs.lookup(&root, "link").unwrap() {
        Node::File(f) => f,
        other => panic!("expected symlink node, got {other:?}"),
    };
    assert_eq!(link.attr.kind, ItemKind::Symlink);
    assert_eq!(link.link_target.as_deref(), Some("hello.txt"));
}

#[test]
fn snapshot_attrs_use_summary_size_and_process_owner() {
    let (fs, _) = mounted_fs("mount-attrs");
    let entry = fs.root_entries().unwrap()[0].clone();
    let root = fs.lookup_snapshot(&entry.name).unwrap();
    assert_eq!(root.attr.size, entry.size);
    assert_eq!(root.attr.uid, unsafe { libc::geteuid() });
    assert_eq!(root.attr.ttl, mount::ATTR_TTL);
}

#[test]
fn mutations_surface_erofs() {
    let err = mount::erofs();
    match err {
        coffre_types::CoffreError::Io(io) => {
            assert_eq!(io.raw_os_error(), Some(libc::EROFS));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
