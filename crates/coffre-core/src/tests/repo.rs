use crate::crypto;
use crate::repo::{resolve_secret, Configuration, Repository};
use crate::storage::{store_config_from_location, Store};
use crate::testutil::{mock_repo, mock_repo_with_encryption};
use coffre_types::CoffreError;

#[test]
fn init_then_open_no_rebuild() {
    let test = mock_repo("repo-open");
    let repo_id = test.repo.configuration().repository_id;

    let store = Box::new(test.store());
    let serialized = store.open().unwrap();
    let reopened = Repository::open_no_rebuild(store, &serialized, None, test.cache.path()).unwrap();
    assert_eq!(reopened.configuration().repository_id, repo_id);
}

#[test]
fn corrupt_config_is_rejected() {
    let test = mock_repo("repo-corrupt");
    let store = Box::new(test.store());
    let mut serialized = store.open().unwrap();
    let mid = serialized.len() / 2;
    serialized[mid] ^= 0x80;
    assert!(Repository::open_no_rebuild(store, &serialized, None, test.cache.path()).is_err());
}

#[test]
fn rebuild_state_merges_remote_states() {
    let test = mock_repo("repo-rebuild");
    let source = tempfile::tempdir().unwrap();
    crate::testutil::sample_tree(source.path());

    let opts = crate::commands::backup::BackupOptions {
        job: "t".into(),
        tags: vec![],
        excludes: vec![],
    };
    let outcome = crate::commands::backup::run(&test.repo, source.path(), &opts, None).unwrap();

    // A second open starts empty and recovers everything with one rebuild.
    let store = Box::new(test.store());
    let serialized = store.open().unwrap();
    let cache2 = tempfile::tempdir().unwrap();
    let fresh = Repository::open_no_rebuild(store, &serialized, None, cache2.path()).unwrap();
    assert!(fresh.locate_snapshot_ids().is_empty());

    fresh.rebuild_state().unwrap();
    assert_eq!(fresh.locate_snapshot_ids(), vec![outcome.snapshot_id]);
}

#[test]
fn state_cache_survives_reopen() {
    let test = mock_repo("repo-cache");
    let source = tempfile::tempdir().unwrap();
    crate::testutil::sample_tree(source.path());

    let opts = crate::commands::backup::BackupOptions {
        job: "t".into(),
        tags: vec![],
        excludes: vec![],
    };
    let outcome = crate::commands::backup::run(&test.repo, source.path(), &opts, None).unwrap();
    test.repo.rebuild_state().unwrap();

    // Same cache dir: the aggregate is loaded without any store round trip.
    let store = Box::new(test.store());
    let serialized = store.open().unwrap();
    let reopened =
        Repository::open_no_rebuild(store, &serialized, None, test.cache.path()).unwrap();
    assert_eq!(reopened.locate_snapshot_ids(), vec![outcome.snapshot_id]);
}

#[test]
fn ingest_single_state_file() {
    let test = mock_repo("repo-ingest");
    let source = tempfile::tempdir().unwrap();
    crate::testutil::sample_tree(source.path());

    let opts = crate::commands::backup::BackupOptions {
        job: "t".into(),
        tags: vec![],
        excludes: vec![],
    };
    let outcome = crate::commands::backup::run(&test.repo, source.path(), &opts, None).unwrap();

    let store = Box::new(test.store());
    let serialized = store.open().unwrap();
    let cache2 = tempfile::tempdir().unwrap();
    let fresh = Repository::open_no_rebuild(store, &serialized, None, cache2.path()).unwrap();
    fresh.ingest_state_file(outcome.state_id).unwrap();
    assert_eq!(fresh.locate_snapshot_ids(), vec![outcome.snapshot_id]);
}

// ── Secret resolution ──────────────────────────────────────────────────

#[test]
fn plaintext_repo_needs_no_secret() {
    let configuration = Configuration::new(None);
    let config = store_config_from_location("mock://x");
    assert!(resolve_secret(&configuration, &config, &[])
        .unwrap()
        .is_none());
}

#[test]
fn passphrase_from_store_config() {
    let block = crypto::new_encryption_block(b"sesame").unwrap();
    let configuration = Configuration::new(Some(block));

    let mut config = store_config_from_location("mock://x");
    config.insert("passphrase".into(), "sesame".into());
    assert!(resolve_secret(&configuration, &config, &[])
        .unwrap()
        .is_some());
}

#[test]
fn wrong_passphrase_fails_verification() {
    let block = crypto::new_encryption_block(b"sesame").unwrap();
    let configuration = Configuration::new(Some(block));

    let mut config = store_config_from_location("mock://x");
    config.insert("passphrase".into(), "wrong".into());
    assert!(matches!(
        resolve_secret(&configuration, &config, &[]),
        Err(CoffreError::KeyVerification)
    ));
}

#[test]
fn passphrase_command_output_is_used() {
    let block = crypto::new_encryption_block(b"from-command").unwrap();
    let configuration = Configuration::new(Some(block));

    let mut config = store_config_from_location("mock://x");
    config.insert("passphrase_cmd".into(), "echo from-command".into());
    assert!(resolve_secret(&configuration, &config, &[])
        .unwrap()
        .is_some());
}

#[test]
fn missing_passphrase_is_config_error() {
    let block = crypto::new_encryption_block(b"x").unwrap();
    let configuration = Configuration::new(Some(block));
    let config = store_config_from_location("mock://x");
    assert!(matches!(
        resolve_secret(&configuration, &config, &[]),
        Err(CoffreError::Config(_))
    ));
}

#[test]
fn provided_secret_is_canary_checked() {
    let block = crypto::new_encryption_block(b"sesame").unwrap();
    let good = crypto::derive_key(&block.kdf, b"sesame").unwrap();
    let configuration = Configuration::new(Some(block));
    let config = store_config_from_location("mock://x");

    assert!(resolve_secret(&configuration, &config, good.as_ref())
        .unwrap()
        .is_some());
    assert!(matches!(
        resolve_secret(&configuration, &config, &[7u8; 32]),
        Err(CoffreError::KeyVerification)
    ));
}

#[test]
fn encrypted_repo_round_trip() {
    let block = crypto::new_encryption_block(b"vault").unwrap();
    let key = crypto::derive_key(&block.kdf, b"vault").unwrap();
    let mut test = mock_repo_with_encryption("repo-encrypted", Some(block));
    test.repo.set_secret(key);

    let source = tempfile::tempdir().unwrap();
    crate::testutil::sample_tree(source.path());
    let opts = crate::commands::backup::BackupOptions {
        job: "enc".into(),
        tags: vec![],
        excludes: vec![],
    };
    let outcome = crate::commands::backup::run(&test.repo, source.path(), &opts, None).unwrap();

    let snapshot = test.repo.load_snapshot(outcome.snapshot_id).unwrap();
    assert_eq!(snapshot.header.job, "enc");
}
