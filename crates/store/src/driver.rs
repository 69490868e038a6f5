//! Backend driver contract plus the in-memory implementation used by tests
//! and embedders that don't need persistence.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use anyhow::Result;

/// Narrow key-value contract the object store is written against. Keys are
/// scanned in ascending lexicographic order; the store's key layout makes
/// that order meaningful (generations sort numerically).
pub trait Driver: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// BTreeMap-backed driver. Scan order comes for free.
#[derive(Default)]
pub struct MemoryDriver {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, for tests that assert persistence ordering.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw lookup, for tests that need to observe the persisted bytes.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(key).cloned()
    }
}

impl Driver for MemoryDriver {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.lock().unwrap();
        let out = map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(out)
    }
}
