//! End-to-end registry tests over the in-memory driver: policy lifecycle,
//! revision FIFO processing, write-through result accounting and actual state.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use verge_apply::{ApplyResultUpdater, StateUpdater};
use verge_core::{
    ComponentInstance, ComponentKey, Generation, PolicyResolution, Storable, TypeInfo,
};
use verge_registry::{Registry, RevisionStatus};
use verge_store::{Driver, MemoryDriver};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Service {
    namespace: String,
    name: String,
    #[serde(default)]
    generation: Generation,
    #[serde(default)]
    deleted: bool,
    image: String,
}

impl Service {
    fn new(namespace: &str, name: &str, image: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            generation: Generation::LAST,
            deleted: false,
            image: image.to_string(),
        }
    }
}

impl Storable for Service {
    fn kind(&self) -> &'static str {
        "service"
    }
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn name(&self) -> String {
        self.name.clone()
    }
    fn generation(&self) -> Generation {
        self.generation
    }
    fn set_generation(&mut self, gen: Generation) {
        self.generation = gen;
    }
    fn is_deleted(&self) -> bool {
        self.deleted
    }
    fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Driver double that can be switched to fail writes, for pinning the
/// persist-before-publish ordering.
struct FlakyDriver {
    inner: MemoryDriver,
    fail_puts: AtomicBool,
}

impl FlakyDriver {
    fn new() -> Self {
        Self {
            inner: MemoryDriver::new(),
            fail_puts: AtomicBool::new(false),
        }
    }

    fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

impl Driver for FlakyDriver {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(anyhow!("injected write failure"));
        }
        self.inner.put(key, value)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }
}

fn new_registry() -> Arc<Registry> {
    Arc::new(Registry::new(
        Arc::new(MemoryDriver::new()),
        vec![TypeInfo::new::<Service>("service", true)],
    ))
}

fn boxed(services: Vec<Service>) -> Vec<Box<dyn Storable>> {
    services
        .into_iter()
        .map(|svc| Box::new(svc) as Box<dyn Storable>)
        .collect()
}

fn instance(name: &str) -> ComponentInstance {
    ComponentInstance::new(
        ComponentKey::new("main", name, "backend", "prod"),
        Some("helm".to_string()),
        serde_json::json!({"cluster": "us-east"}),
    )
}

#[test]
fn init_creates_empty_policy_and_first_revision() {
    let registry = new_registry();
    assert!(registry.init_policy().unwrap());
    assert!(!registry.init_policy().unwrap());

    let (policy, gen) = registry.get_policy(Generation::LAST).unwrap();
    assert!(policy.is_empty());
    assert_eq!(gen, Generation::FIRST);

    let revision = registry.get_revision(Generation::LAST).unwrap().unwrap();
    assert_eq!(revision.generation, Generation::FIRST);
    assert_eq!(revision.policy_gen, Generation::FIRST);
    assert_eq!(revision.status, RevisionStatus::Waiting);
    assert!(registry.get_desired_state(&revision).unwrap().is_empty());
}

#[test]
fn uninitialized_registry_reads_as_empty_policy() {
    let registry = new_registry();
    let (policy, gen) = registry.get_policy(Generation::LAST).unwrap();
    assert!(policy.is_empty());
    assert_eq!(gen, Generation::LAST);
}

#[test]
fn update_policy_stores_objects_and_advances_manifest() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    let mut objs = boxed(vec![
        Service::new("main", "web", "web:1"),
        Service::new("main", "db", "db:1"),
    ]);
    let (changed, data) = registry.update_policy(&mut objs, "alice").unwrap();
    assert!(changed);
    assert_eq!(data.generation, Generation(2));
    assert_eq!(data.updated_by, "alice");
    assert_eq!(data.object_count(), 2);
    // Objects carry their store-assigned generations back to the caller.
    assert_eq!(objs[0].generation(), Generation::FIRST);

    let (policy, gen) = registry.get_policy(Generation::LAST).unwrap();
    assert_eq!(gen, Generation(2));
    assert_eq!(policy.len(), 2);
    assert!(policy.get_object("main", "service", "web").is_some());

    // Identical content is deduplicated end to end: no new object generation,
    // no new manifest generation.
    let mut again = boxed(vec![
        Service::new("main", "web", "web:1"),
        Service::new("main", "db", "db:1"),
    ]);
    let (changed, data) = registry.update_policy(&mut again, "alice").unwrap();
    assert!(!changed);
    assert_eq!(data.generation, Generation(2));

    // Changed content advances both.
    let mut update = boxed(vec![Service::new("main", "web", "web:2")]);
    let (changed, data) = registry.update_policy(&mut update, "bob").unwrap();
    assert!(changed);
    assert_eq!(update[0].generation(), Generation(2));
    assert_eq!(data.generation, Generation(3));
    assert_eq!(data.objects["main"]["service"]["web"], Generation(2));
    assert_eq!(data.objects["main"]["service"]["db"], Generation(1));
}

#[test]
fn update_policy_rejects_deleted_objects() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    let mut svc = Service::new("main", "web", "web:1");
    svc.deleted = true;
    let err = registry
        .update_policy(&mut boxed(vec![svc]), "alice")
        .unwrap_err();
    assert!(err.to_string().contains("deleted"));
}

#[test]
#[should_panic(expected = "init_policy was never called")]
fn update_policy_before_init_panics() {
    let registry = new_registry();
    let _ = registry.update_policy(&mut boxed(vec![Service::new("main", "web", "web:1")]), "alice");
}

#[test]
fn delete_from_policy_drops_membership_and_tombstones() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    let mut objs = boxed(vec![
        Service::new("main", "web", "web:1"),
        Service::new("main", "db", "db:1"),
    ]);
    registry.update_policy(&mut objs, "alice").unwrap();

    let doomed = boxed(vec![Service::new("main", "web", "web:1")]);
    let (changed, data) = registry.delete_from_policy(&doomed, "bob").unwrap();
    assert!(changed);
    assert_eq!(data.object_count(), 1);

    let (policy, _) = registry.get_policy(Generation::LAST).unwrap();
    assert!(policy.get_object("main", "service", "web").is_none());
    assert!(policy.get_object("main", "service", "db").is_some());

    // The stored object is tombstoned, not erased; its history survives.
    let stored = registry
        .store()
        .get_by_name("main", "service", "web", Generation::LAST)
        .unwrap()
        .unwrap();
    assert!(stored.is_deleted());
    let history = registry
        .store()
        .get_generations("main", "service", "web")
        .unwrap();
    assert_eq!(history.len(), 2);

    // Deleting again changes nothing.
    let (changed, _) = registry.delete_from_policy(&doomed, "bob").unwrap();
    assert!(!changed);

    // A deleted object can rejoin the policy via a fresh update.
    let mut back = boxed(vec![Service::new("main", "web", "web:1")]);
    let (changed, data) = registry.update_policy(&mut back, "alice").unwrap();
    assert!(changed);
    assert_eq!(data.object_count(), 2);
}

#[test]
fn revisions_are_processed_fifo() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    registry
        .new_revision(Generation(2), PolicyResolution::new(), false)
        .unwrap();
    registry
        .new_revision(Generation(3), PolicyResolution::new(), true)
        .unwrap();

    // Oldest waiting revision comes first.
    let mut first = registry.get_first_unprocessed_revision().unwrap().unwrap();
    assert_eq!(first.generation, Generation(1));

    first.status = RevisionStatus::Completed;
    registry.update_revision(&first).unwrap();

    let second = registry.get_first_unprocessed_revision().unwrap().unwrap();
    assert_eq!(second.generation, Generation(2));
    assert!(!second.recalculate_all);

    // An in-progress revision is still unprocessed: a restarted engine
    // resumes it rather than skipping ahead.
    let mut resumed = second;
    resumed.status = RevisionStatus::InProgress;
    registry.update_revision(&resumed).unwrap();
    let picked = registry.get_first_unprocessed_revision().unwrap().unwrap();
    assert_eq!(picked.generation, Generation(2));
    assert_eq!(picked.status, RevisionStatus::InProgress);
}

#[test]
fn revisions_query_by_policy_generation() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    registry
        .new_revision(Generation(2), PolicyResolution::new(), false)
        .unwrap();
    registry
        .new_revision(Generation(2), PolicyResolution::new(), false)
        .unwrap();
    registry
        .new_revision(Generation(3), PolicyResolution::new(), false)
        .unwrap();

    let for_two = registry.get_all_revisions_for_policy(Generation(2)).unwrap();
    assert_eq!(for_two.len(), 2);
    assert_eq!(for_two[0].generation, Generation(2));
    assert_eq!(for_two[1].generation, Generation(3));

    let last = registry
        .get_last_revision_for_policy(Generation(2))
        .unwrap()
        .unwrap();
    assert_eq!(last.generation, Generation(3));

    assert!(registry
        .get_last_revision_for_policy(Generation(9))
        .unwrap()
        .is_none());

    assert_eq!(registry.get_all_revisions().unwrap().len(), 4);
}

#[test]
fn desired_state_travels_with_its_revision() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    let mut resolution = PolicyResolution::new();
    resolution.insert(instance("web"));
    let revision = registry
        .new_revision(Generation(2), resolution, false)
        .unwrap();

    let loaded = registry.get_desired_state(&revision).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded.get("main#web#backend#prod").is_some());

    // The first (init) revision has its own, empty desired state.
    let first = registry.get_revision(Generation::FIRST).unwrap().unwrap();
    assert!(registry.get_desired_state(&first).unwrap().is_empty());
}

#[test]
fn result_updater_persists_progress_write_through() {
    let registry = new_registry();
    registry.init_policy().unwrap();
    let revision = registry.get_revision(Generation::LAST).unwrap().unwrap();

    let updater = registry.new_revision_result_updater(revision);
    updater.set_total(3);

    // In progress is visible in the store before any counter moves.
    let stored = registry.get_revision(Generation::FIRST).unwrap().unwrap();
    assert_eq!(stored.status, RevisionStatus::InProgress);
    assert_eq!(stored.result.total, 3);

    updater.add_success();
    updater.add_failed();
    updater.add_skipped();

    let stored = registry.get_revision(Generation::FIRST).unwrap().unwrap();
    assert_eq!(stored.result.success, 1);
    assert_eq!(stored.result.failed, 1);
    assert_eq!(stored.result.skipped, 1);

    let result = updater.done();
    assert_eq!(result.total, 3);

    let stored = registry.get_revision(Generation::FIRST).unwrap().unwrap();
    assert_eq!(stored.status, RevisionStatus::Completed);
    assert!(stored.applied_at.is_some());
}

#[test]
#[should_panic(expected = "(total)")]
fn result_updater_panics_on_counter_mismatch() {
    let registry = new_registry();
    registry.init_policy().unwrap();
    let revision = registry.get_revision(Generation::LAST).unwrap().unwrap();

    let updater = registry.new_revision_result_updater(revision);
    updater.set_total(3);
    updater.add_success();
    updater.done();
}

#[test]
fn actual_state_updater_persists_before_publishing() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    let updater = registry.new_actual_state_updater(registry.get_actual_state().unwrap());
    updater.create(instance("web")).unwrap();

    let key = "main#web#backend#prod";
    assert!(updater.get(key).is_some());
    // A second registry view, reading straight from the store, already sees it.
    assert_eq!(registry.get_actual_state().unwrap().len(), 1);

    updater
        .update(key, &|inst| {
            inst.depends_on.insert("claim-1".to_string());
        })
        .unwrap();
    let stored = registry.get_actual_state().unwrap();
    assert!(stored.get(key).unwrap().depends_on.contains("claim-1"));

    updater.delete(key).unwrap();
    assert!(updater.get(key).is_none());
    assert!(registry.get_actual_state().unwrap().is_empty());

    // Tombstoned history is still in the store.
    let history = registry
        .store()
        .get_generations(verge_core::SYSTEM_NS, "component-instance", key)
        .unwrap();
    assert!(history.last().unwrap().is_deleted());
}

#[test]
fn failed_persist_never_publishes_to_actual_state() {
    let driver = Arc::new(FlakyDriver::new());
    let registry = Arc::new(Registry::new(
        driver.clone(),
        vec![TypeInfo::new::<Service>("service", true)],
    ));
    registry.init_policy().unwrap();

    let updater = registry.new_actual_state_updater(PolicyResolution::new());
    let key = "main#web#backend#prod";
    updater.create(instance("web")).unwrap();

    driver.fail_puts(true);

    // A failed create publishes nothing.
    let err = updater.create(instance("db")).unwrap_err();
    assert!(format!("{:#}", err).contains("injected write failure"));
    assert!(updater.get("main#db#backend#prod").is_none());
    assert_eq!(updater.snapshot().len(), 1);

    // A failed update leaves the published instance at its old version.
    let err = updater
        .update(key, &|inst| {
            inst.depends_on.insert("claim-1".to_string());
        })
        .unwrap_err();
    assert!(format!("{:#}", err).contains("injected write failure"));
    assert!(updater.get(key).unwrap().depends_on.is_empty());

    // A failed delete keeps the instance published.
    let err = updater.delete(key).unwrap_err();
    assert!(format!("{:#}", err).contains("injected write failure"));
    assert!(updater.get(key).is_some());

    // The store never got ahead of or behind the published map.
    driver.fail_puts(false);
    let stored = registry.get_actual_state().unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored.get(key).unwrap().depends_on.is_empty());
}

#[test]
fn actual_state_update_of_missing_instance_fails() {
    let registry = new_registry();
    registry.init_policy().unwrap();

    let updater = registry.new_actual_state_updater(PolicyResolution::new());
    let err = updater.update("main#ghost#backend#prod", &|_| {}).unwrap_err();
    assert!(err.to_string().contains("doesn't exist"));
}
