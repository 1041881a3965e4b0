use coffre_protocol::ResourceKind;
use coffre_types::Mac;

use crate::commands::backup;
use crate::repair;
use crate::repo::state::LocalState;
use crate::repo::{BlobType, PackfileBuilder};
use crate::storage::Store;
use crate::testutil::{mac, mock_repo, sample_tree};

/// Seed: one healthy state (via a real backup) plus two packfiles whose
/// state file is "lost" (never published).
fn seed_orphans(test: &crate::testutil::TestRepo, lost_state: Mac) -> (Mac, Mac) {
    let source = tempfile::tempdir().unwrap();
    sample_tree(source.path());
    backup::run(
        &test.repo,
        source.path(),
        &backup::BackupOptions {
            job: "healthy".into(),
            tags: vec![],
            excludes: vec![],
        },
        None,
    )
    .unwrap();

    let key = test.repo.object_key();

    let mut b1 = PackfileBuilder::new(lost_state, 2_000);
    b1.add_blob(BlobType::Chunk, Mac::compute(&key, b"orphan-one"), b"orphan-one")
        .unwrap();
    let (pf1, bytes1, _) = b1.finish(&key).unwrap();
    test.repo.put_packfile(pf1, &bytes1).unwrap();

    let mut b2 = PackfileBuilder::new(lost_state, 1_000);
    b2.add_blob(BlobType::Chunk, Mac::compute(&key, b"orphan-two"), b"orphan-two")
        .unwrap();
    let (pf2, bytes2, _) = b2.finish(&key).unwrap();
    test.repo.put_packfile(pf2, &bytes2).unwrap();

    (pf1, pf2)
}

#[test]
fn dry_run_reports_without_writing() {
    let test = mock_repo("repair-dry");
    let lost = mac(0x52);
    seed_orphans(&test, lost);

    let states_before = test.repo.get_states().unwrap();
    let orphans = repair::run(&test.repo, false).unwrap();
    assert_eq!(orphans, vec![lost]);
    assert_eq!(test.repo.get_states().unwrap(), states_before);
}

#[test]
fn apply_reconstructs_the_missing_state() {
    let test = mock_repo("repair-apply");
    let lost = mac(0x52);
    let (pf1, pf2) = seed_orphans(&test, lost);

    let repaired = repair::run(&test.repo, true).unwrap();
    assert_eq!(repaired, vec![lost]);

    // Published under the exact missing id.
    assert!(test.repo.get_states().unwrap().contains(&lost));

    let raw = test
        .store()
        .get(ResourceKind::State, lost, None)
        .unwrap();
    let state = LocalState::from_stream(&raw).unwrap();
    assert_eq!(state.len(), 2);
    // Timestamp is the minimum over the two footers.
    assert_eq!(state.metadata.timestamp, 1_000);
    let packfiles: Vec<Mac> = state.deltas().map(|d| d.packfile).collect();
    assert!(packfiles.contains(&pf1));
    assert!(packfiles.contains(&pf2));
}

#[test]
fn repair_is_idempotent() {
    let test = mock_repo("repair-idempotent");
    let lost = mac(0x52);
    seed_orphans(&test, lost);

    assert_eq!(repair::run(&test.repo, true).unwrap(), vec![lost]);
    // Second application finds nothing to do.
    assert!(repair::run(&test.repo, true).unwrap().is_empty());
}

#[test]
fn healthy_states_are_left_alone() {
    let test = mock_repo("repair-healthy");
    let source = tempfile::tempdir().unwrap();
    sample_tree(source.path());
    backup::run(
        &test.repo,
        source.path(),
        &backup::BackupOptions {
            job: "healthy".into(),
            tags: vec![],
            excludes: vec![],
        },
        None,
    )
    .unwrap();

    assert!(repair::run(&test.repo, true).unwrap().is_empty());
}

#[test]
fn reconstructed_state_restores_readability() {
    let test = mock_repo("repair-readable");
    let lost = mac(0x52);
    seed_orphans(&test, lost);
    repair::run(&test.repo, true).unwrap();

    // A fresh rebuild over remote states must now resolve the orphaned
    // chunks through the reconstructed state.
    test.repo.rebuild_state().unwrap();
    let key = test.repo.object_key();
    let data = test
        .repo
        .read_blob(Mac::compute(&key, b"orphan-one"))
        .unwrap();
    assert_eq!(data, b"orphan-one");
}
