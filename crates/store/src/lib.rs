//! Verge versioned object store: generation assignment, content dedup,
//! last-generation and by-field lookup on top of a narrow KV driver.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::debug;

use verge_core::{key_for_storable, key_from_parts, storage_key, Catalog, Generation, Storable, TypeInfo};

pub mod driver;
pub mod sqlite;

pub use driver::{Driver, MemoryDriver};
pub use sqlite::SqliteDriver;

/// Versioned object store. Serializes the read-last-generation / dedup /
/// write-next-generation sequence per key, so concurrent writers to the same
/// key can never both observe the same "last generation".
pub struct ObjectStore {
    driver: Arc<dyn Driver>,
    catalog: Catalog,
    locks: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl ObjectStore {
    pub fn new(driver: Arc<dyn Driver>, catalog: Catalog) -> Self {
        Self {
            driver,
            catalog,
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(key.to_string()).or_default().clone()
    }

    fn latest_snapshot(&self, key: &str, info: &TypeInfo) -> Result<Option<Box<dyn Storable>>> {
        let rows = self.driver.scan_prefix(&format!("{}:", key))?;
        match rows.last() {
            Some((_, bytes)) => Ok(Some(info.decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Saves an object. For versioned kinds: assigns `FirstGen` to new keys,
    /// returns `false` without writing when the content equals the stored
    /// last generation (generation ignored in the comparison), otherwise
    /// writes the next generation. Non-versioned kinds always overwrite
    /// generation 0. On return the object carries its resolved generation.
    pub fn save(&self, obj: &mut dyn Storable) -> Result<bool> {
        self.save_inner(obj, false)
    }

    /// Saves a new generation even when the content equals the stored last
    /// one. For records whose identity is the generation itself (revisions):
    /// two identical payloads must still become two distinct records.
    pub fn save_new_generation(&self, obj: &mut dyn Storable) -> Result<bool> {
        self.save_inner(obj, true)
    }

    fn save_inner(&self, obj: &mut dyn Storable, force_new: bool) -> Result<bool> {
        let started = std::time::Instant::now();
        let info = self.catalog.get(obj.kind());
        let key = key_for_storable(obj);

        if !info.versioned {
            obj.set_generation(Generation::LAST);
            let bytes = info.encode(obj)?;
            self.driver.put(&storage_key(&key, Generation::LAST), &bytes)?;
            self.write_index_rows(info, obj)?;
            histogram!("store_save_ms", started.elapsed().as_secs_f64() * 1000.0);
            counter!("store_save_total", 1u64);
            return Ok(true);
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().unwrap();

        match self.latest_snapshot(&key, info)? {
            Some(prev) => {
                let prev_gen = prev.generation();
                if !force_new {
                    obj.set_generation(prev_gen);
                    if info.encode(obj)? == info.encode(prev.as_ref())? {
                        counter!("store_save_dedup_total", 1u64);
                        debug!(key = %key, gen = %prev_gen, "save deduplicated, content unchanged");
                        return Ok(false);
                    }
                }
                obj.set_generation(prev_gen.next());
            }
            None => obj.set_generation(Generation::FIRST),
        }

        let bytes = info.encode(obj)?;
        self.driver.put(&storage_key(&key, obj.generation()), &bytes)?;
        self.write_index_rows(info, obj)?;
        debug!(key = %key, gen = %obj.generation(), "saved new generation");
        histogram!("store_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_save_total", 1u64);
        Ok(true)
    }

    /// Writes an object back at its current generation, without advancing it.
    /// Used for write-through progress updates on an already-created snapshot.
    pub fn update(&self, obj: &dyn Storable) -> Result<()> {
        let info = self.catalog.get(obj.kind());
        if info.versioned && obj.generation().is_last() {
            return Err(anyhow!(
                "in-place update requires a concrete generation for kind '{}'",
                obj.kind()
            ));
        }
        let key = key_for_storable(obj);
        let bytes = info.encode(obj)?;
        self.driver.put(&storage_key(&key, obj.generation()), &bytes)?;
        self.write_index_rows(info, obj)?;
        Ok(())
    }

    /// Returns one snapshot, or `None` if absent. `Generation::LAST` resolves
    /// to the highest stored generation via a prefix scan.
    pub fn get_by_name(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        gen: Generation,
    ) -> Result<Option<Box<dyn Storable>>> {
        let started = std::time::Instant::now();
        let info = self.catalog.get(kind);
        let key = key_from_parts(namespace, kind, name);
        let result = if gen.is_last() && info.versioned {
            self.latest_snapshot(&key, info)?
        } else {
            let lookup = if info.versioned { gen } else { Generation::LAST };
            match self.driver.get(&storage_key(&key, lookup))? {
                Some(bytes) => Some(info.decode(&bytes)?),
                None => None,
            }
        };
        histogram!("store_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(result)
    }

    /// Returns the latest stored generation of every distinct name under
    /// `namespace:kind`, tombstones included.
    pub fn get_all(&self, namespace: &str, kind: &str) -> Result<Vec<Box<dyn Storable>>> {
        let info = self.catalog.get(kind);
        let prefix = format!("{}:{}:", namespace, kind);
        let rows = self.driver.scan_prefix(&prefix)?;
        // Ascending key order means the last snapshot seen per name wins.
        let mut latest: std::collections::BTreeMap<String, Box<dyn Storable>> = Default::default();
        for (_, bytes) in rows {
            let obj = info.decode(&bytes)?;
            latest.insert(obj.name(), obj);
        }
        Ok(latest.into_values().collect())
    }

    /// All stored generations of one object, ascending.
    pub fn get_generations(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Vec<Box<dyn Storable>>> {
        let info = self.catalog.get(kind);
        let key = key_from_parts(namespace, kind, name);
        let rows = self.driver.scan_prefix(&format!("{}:", key))?;
        rows.iter().map(|(_, bytes)| info.decode(bytes)).collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Soft delete: loads the last generation, marks it deleted and saves the
    /// tombstone as a new generation. History is never dropped. Returns
    /// `false` when the object is absent or already tombstoned.
    pub fn delete(&self, namespace: &str, kind: &str, name: &str) -> Result<bool> {
        match self.get_by_name(namespace, kind, name, Generation::LAST)? {
            Some(mut obj) => {
                if obj.is_deleted() {
                    return Ok(false);
                }
                obj.set_deleted(true);
                self.save(obj.as_mut())?;
                counter!("store_delete_total", 1u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Looks up snapshots through a declared field index.
    pub fn find_by_index(
        &self,
        kind: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Box<dyn Storable>>> {
        let info = self.catalog.get(kind);
        if !info.indexes.iter().any(|d| d.field == field) {
            return Err(anyhow!("kind '{}' has no index on field '{}'", kind, field));
        }
        let rows = self.driver.scan_prefix(&index_prefix(kind, field, value))?;
        let mut out = Vec::with_capacity(rows.len());
        for (idx_key, main_key) in rows {
            let main_key = String::from_utf8(main_key)
                .map_err(|_| anyhow!("corrupt index row: {}", idx_key))?;
            match self.driver.get(&main_key)? {
                Some(bytes) => out.push(info.decode(&bytes)?),
                None => return Err(anyhow!("dangling index row: {} -> {}", idx_key, main_key)),
            }
        }
        Ok(out)
    }

    fn write_index_rows(&self, info: &TypeInfo, obj: &dyn Storable) -> Result<()> {
        for descriptor in &info.indexes {
            if let Some(value) = (descriptor.extract)(obj) {
                let row_key = format!(
                    "{}{}:{}:{}",
                    index_prefix(info.kind, descriptor.field, &value),
                    obj.namespace(),
                    obj.name(),
                    obj.generation().as_store_suffix()
                );
                let main_key = storage_key(&key_for_storable(obj), obj.generation());
                self.driver.put(&row_key, main_key.as_bytes())?;
            }
        }
        Ok(())
    }
}

fn index_prefix(kind: &str, field: &str, value: &str) -> String {
    format!("idx:{}:{}={}:", kind, field, value)
}
