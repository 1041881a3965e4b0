use std::path::Path;

use coffre_types::Mac;

use crate::crypto::EncryptionBlock;
use crate::repo::Repository;
use crate::storage::mock_backend::MockStore;

/// A mock-backed repository plus the temp dir its scan cache lives in.
pub struct TestRepo {
    pub repo: Repository,
    pub cache: tempfile::TempDir,
    pub store_name: String,
}

impl TestRepo {
    pub fn store(&self) -> MockStore {
        MockStore::shared(&self.store_name)
    }
}

/// Fresh plaintext repository on a named mock store.
pub fn mock_repo(name: &str) -> TestRepo {
    mock_repo_with_encryption(name, None)
}

pub fn mock_repo_with_encryption(name: &str, encryption: Option<EncryptionBlock>) -> TestRepo {
    MockStore::reset(name);
    let cache = tempfile::tempdir().unwrap();
    let store = Box::new(MockStore::shared(name));
    let repo = Repository::init(store, encryption, cache.path()).unwrap();
    TestRepo {
        repo,
        cache,
        store_name: name.to_string(),
    }
}

/// Write a small source tree: two top-level files, a subdirectory and a
/// symlink.
pub fn sample_tree(dir: &Path) {
    std::fs::create_dir_all(dir.join("docs")).unwrap();
    std::fs::write(dir.join("hello.txt"), b"hello world\n").unwrap();
    std::fs::write(dir.join("data.bin"), vec![0xA5; 2048]).unwrap();
    std::fs::write(dir.join("docs/notes.md"), b"# notes\nsome text\n").unwrap();
    std::os::unix::fs::symlink("hello.txt", dir.join("link")).unwrap();
}

/// A MAC with every byte set to `b`.
pub fn mac(b: u8) -> Mac {
    Mac([b; 32])
}
