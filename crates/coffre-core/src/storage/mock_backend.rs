use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use coffre_protocol::{ByteRange, ResourceKind};
use coffre_types::{CoffreError, Mac, Result};

/// In-process, in-memory store.
///
/// Instances are shared per process through a name registry so a client
/// and a daemon job thread resolving the same `mock://<name>` location
/// operate on the same repository.
#[derive(Debug)]
pub struct MockStore {
    inner: Arc<MockInner>,
    location: String,
}

#[derive(Debug)]
struct MockInner {
    config: Mutex<Option<Vec<u8>>>,
    blobs: Mutex<HashMap<(ResourceKind, Mac), Vec<u8>>>,
    /// Number of `list` calls, per resource kind index. Tests use the
    /// state-list count as a proxy for rebuild invocations.
    list_calls: [AtomicU64; 5],
}

impl MockInner {
    fn new() -> Self {
        MockInner {
            config: Mutex::new(None),
            blobs: Mutex::new(HashMap::new()),
            list_calls: Default::default(),
        }
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<MockInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MockInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn kind_index(kind: ResourceKind) -> usize {
    ResourceKind::ALL
        .iter()
        .position(|k| *k == kind)
        .expect("kind in closed set")
}

impl MockStore {
    /// Fetch (or create) the shared instance registered under `name`.
    pub fn shared(name: &str) -> MockStore {
        let inner = registry()
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockInner::new()))
            .clone();
        MockStore {
            inner,
            location: format!("mock://{name}"),
        }
    }

    /// Drop the shared instance registered under `name`, if any.
    pub fn reset(name: &str) {
        registry().lock().unwrap().remove(name);
    }

    /// How many times `list` ran for `kind` on this shared instance.
    pub fn list_call_count(&self, kind: ResourceKind) -> u64 {
        self.inner.list_calls[kind_index(kind)].load(Ordering::SeqCst)
    }
}

impl super::Store for MockStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn open(&self) -> Result<Vec<u8>> {
        self.inner
            .config
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CoffreError::RepoNotFound(self.location.clone()))
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let mut slot = self.inner.config.lock().unwrap();
        if slot.is_some() {
            return Err(CoffreError::RepoAlreadyExists(self.location.clone()));
        }
        *slot = Some(config.to_vec());
        Ok(())
    }

    fn list(&self, kind: ResourceKind) -> Result<Vec<Mac>> {
        self.inner.list_calls[kind_index(kind)].fetch_add(1, Ordering::SeqCst);
        let blobs = self.inner.blobs.lock().unwrap();
        let mut macs: Vec<Mac> = blobs
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| *m)
            .collect();
        macs.sort();
        Ok(macs)
    }

    fn get(&self, kind: ResourceKind, mac: Mac, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let blobs = self.inner.blobs.lock().unwrap();
        let data = blobs
            .get(&(kind, mac))
            .ok_or_else(|| CoffreError::ResourceNotFound(format!("{kind}/{mac}")))?;

        match range {
            None => Ok(data.clone()),
            Some(r) => {
                let start = r.offset as usize;
                let end = start + r.length as usize;
                if end > data.len() {
                    return Err(CoffreError::Storage(format!(
                        "range [{start}, {end}) past end of {kind}/{mac} ({} bytes)",
                        data.len()
                    )));
                }
                Ok(data[start..end].to_vec())
            }
        }
    }

    fn put(&self, kind: ResourceKind, mac: Mac, data: &[u8]) -> Result<u64> {
        self.inner
            .blobs
            .lock()
            .unwrap()
            .insert((kind, mac), data.to_vec());
        Ok(data.len() as u64)
    }

    fn delete(&self, kind: ResourceKind, mac: Mac) -> Result<()> {
        self.inner
            .blobs
            .lock()
            .unwrap()
            .remove(&(kind, mac))
            .map(|_| ())
            .ok_or_else(|| CoffreError::ResourceNotFound(format!("{kind}/{mac}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    #[test]
    fn shared_instances_alias_by_name() {
        MockStore::reset("alias-test");
        let a = MockStore::shared("alias-test");
        let b = MockStore::shared("alias-test");
        let mac = Mac([1; 32]);
        a.put(ResourceKind::State, mac, b"hello").unwrap();
        assert_eq!(b.get(ResourceKind::State, mac, None).unwrap(), b"hello");
    }

    #[test]
    fn distinct_names_are_isolated() {
        MockStore::reset("iso-a");
        MockStore::reset("iso-b");
        let a = MockStore::shared("iso-a");
        let b = MockStore::shared("iso-b");
        let mac = Mac([2; 32]);
        a.put(ResourceKind::State, mac, b"x").unwrap();
        assert!(b.get(ResourceKind::State, mac, None).is_err());
    }

    #[test]
    fn two_puts_equal_one() {
        MockStore::reset("double-put");
        let store = MockStore::shared("double-put");
        let mac = Mac([3; 32]);
        store.put(ResourceKind::Packfile, mac, b"same").unwrap();
        store.put(ResourceKind::Packfile, mac, b"same").unwrap();
        assert_eq!(store.list(ResourceKind::Packfile).unwrap(), vec![mac]);
    }

    #[test]
    fn range_semantics_match_fs() {
        MockStore::reset("range");
        let store = MockStore::shared("range");
        let mac = Mac([4; 32]);
        let data: Vec<u8> = (0..=255u8).collect();
        store.put(ResourceKind::Packfile, mac, &data).unwrap();
        let got = store
            .get(
                ResourceKind::Packfile,
                mac,
                Some(ByteRange {
                    offset: 10,
                    length: 100,
                }),
            )
            .unwrap();
        assert_eq!(got, &data[10..110]);
    }

    #[test]
    fn list_counter_increments() {
        MockStore::reset("counter");
        let store = MockStore::shared("counter");
        assert_eq!(store.list_call_count(ResourceKind::State), 0);
        store.list(ResourceKind::State).unwrap();
        store.list(ResourceKind::State).unwrap();
        assert_eq!(store.list_call_count(ResourceKind::State), 2);
        assert_eq!(store.list_call_count(ResourceKind::Packfile), 0);
    }
}
