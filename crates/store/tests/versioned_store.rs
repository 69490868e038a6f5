#![forbid(unsafe_code)]

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use verge_core::{Catalog, Generation, IndexDescriptor, Storable, TypeInfo};
use verge_store::{Driver, MemoryDriver, ObjectStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Task {
    namespace: String,
    name: String,
    #[serde(default)]
    generation: Generation,
    #[serde(default)]
    deleted: bool,
    owner: String,
    payload: String,
}

impl Task {
    fn new(namespace: &str, name: &str, owner: &str, payload: &str) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generation: Generation::LAST,
            deleted: false,
            owner: owner.into(),
            payload: payload.into(),
        }
    }
}

impl Storable for Task {
    fn kind(&self) -> &'static str {
        "task"
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Blob {
    name: String,
    #[serde(default)]
    generation: Generation,
    #[serde(default)]
    deleted: bool,
    data: String,
}

impl Storable for Blob {
    fn kind(&self) -> &'static str {
        "blob"
    }
    fn namespace(&self) -> &str {
        "system"
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

fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.register(TypeInfo::new::<Task>("task", true).with_index(IndexDescriptor {
        field: "owner",
        extract: |obj| obj.as_any().downcast_ref::<Task>().map(|t| t.owner.clone()),
    }));
    catalog.register(TypeInfo::new::<Blob>("blob", false));
    catalog
}

fn store() -> ObjectStore {
    ObjectStore::new(Arc::new(MemoryDriver::new()), catalog())
}

fn downcast_task(obj: Box<dyn Storable>) -> Task {
    obj.as_any().downcast_ref::<Task>().cloned().unwrap()
}

#[test]
fn save_assigns_first_gen_then_dedups_then_advances() {
    let store = store();

    let mut t = Task::new("main", "svc1", "alice", "v1");
    assert!(store.save(&mut t).unwrap());
    assert_eq!(t.generation, Generation::FIRST);

    // Identical content: no new generation.
    let mut same = Task::new("main", "svc1", "alice", "v1");
    assert!(!store.save(&mut same).unwrap());
    assert_eq!(same.generation, Generation::FIRST);

    // Changed content: next generation.
    let mut changed = Task::new("main", "svc1", "alice", "v2");
    assert!(store.save(&mut changed).unwrap());
    assert_eq!(changed.generation, Generation(2));

    let last = store
        .get_by_name("main", "task", "svc1", Generation::LAST)
        .unwrap()
        .unwrap();
    assert_eq!(downcast_task(last).payload, "v2");
    let first = store
        .get_by_name("main", "task", "svc1", Generation::FIRST)
        .unwrap()
        .unwrap();
    assert_eq!(downcast_task(first).payload, "v1");
}

#[test]
fn generations_are_contiguous_without_gaps() {
    let store = store();
    for i in 0..5 {
        let mut t = Task::new("main", "svc1", "alice", &format!("v{}", i));
        assert!(store.save(&mut t).unwrap());
        assert_eq!(t.generation, Generation(i + 1));
    }
    let gens: Vec<u64> = store
        .get_generations("main", "task", "svc1")
        .unwrap()
        .iter()
        .map(|o| o.generation().0)
        .collect();
    assert_eq!(gens, vec![1, 2, 3, 4, 5]);
}

#[test]
fn forced_save_advances_generation_for_identical_content() {
    let store = store();

    let mut t = Task::new("main", "svc1", "alice", "v1");
    assert!(store.save_new_generation(&mut t).unwrap());
    assert_eq!(t.generation, Generation::FIRST);

    // Same bytes, still a new generation.
    let mut same = Task::new("main", "svc1", "alice", "v1");
    assert!(store.save_new_generation(&mut same).unwrap());
    assert_eq!(same.generation, Generation(2));

    let gens: Vec<u64> = store
        .get_generations("main", "task", "svc1")
        .unwrap()
        .iter()
        .map(|o| o.generation().0)
        .collect();
    assert_eq!(gens, vec![1, 2]);
}

#[test]
fn absent_object_reads_as_none() {
    let store = store();
    assert!(store
        .get_by_name("main", "task", "nope", Generation::LAST)
        .unwrap()
        .is_none());
    assert!(store
        .get_by_name("main", "task", "nope", Generation(3))
        .unwrap()
        .is_none());
}

#[test]
fn delete_writes_tombstone_and_keeps_history() {
    let store = store();
    let mut t = Task::new("main", "svc1", "alice", "v1");
    store.save(&mut t).unwrap();

    assert!(store.delete("main", "task", "svc1").unwrap());
    let last = store
        .get_by_name("main", "task", "svc1", Generation::LAST)
        .unwrap()
        .unwrap();
    assert!(last.is_deleted());
    assert_eq!(last.generation(), Generation(2));

    // Point-in-time read of the pre-delete snapshot still works.
    let old = store
        .get_by_name("main", "task", "svc1", Generation::FIRST)
        .unwrap()
        .unwrap();
    assert!(!old.is_deleted());

    // Idempotent: already tombstoned.
    assert!(!store.delete("main", "task", "svc1").unwrap());
    assert!(!store.delete("main", "task", "missing").unwrap());
}

#[test]
fn get_all_returns_latest_per_name() {
    let store = store();
    for payload in ["a1", "a2"] {
        let mut t = Task::new("main", "svc-a", "alice", payload);
        store.save(&mut t).unwrap();
    }
    let mut b = Task::new("main", "svc-b", "bob", "b1");
    store.save(&mut b).unwrap();

    let all = store.get_all("main", "task").unwrap();
    assert_eq!(all.len(), 2);
    let payloads: Vec<String> = all.into_iter().map(|o| downcast_task(o).payload).collect();
    assert_eq!(payloads, vec!["a2", "b1"]);
}

#[test]
fn non_versioned_kind_overwrites_generation_zero() {
    let store = store();
    let mut blob = Blob {
        name: "state".into(),
        generation: Generation::LAST,
        deleted: false,
        data: "one".into(),
    };
    assert!(store.save(&mut blob).unwrap());
    assert_eq!(blob.generation, Generation::LAST);

    blob.data = "two".into();
    assert!(store.save(&mut blob).unwrap());

    let read = store
        .get_by_name("system", "blob", "state", Generation::LAST)
        .unwrap()
        .unwrap();
    let read = read.as_any().downcast_ref::<Blob>().unwrap();
    assert_eq!(read.data, "two");
}

#[test]
fn field_index_finds_all_matching_generations() {
    let store = store();
    for payload in ["a1", "a2"] {
        let mut t = Task::new("main", "svc-a", "alice", payload);
        store.save(&mut t).unwrap();
    }
    let mut b = Task::new("main", "svc-b", "bob", "b1");
    store.save(&mut b).unwrap();

    let alice = store.find_by_index("task", "owner", "alice").unwrap();
    assert_eq!(alice.len(), 2);
    assert!(alice.iter().all(|o| {
        o.as_any().downcast_ref::<Task>().unwrap().owner == "alice"
    }));

    let err = store.find_by_index("task", "payload", "x").unwrap_err();
    assert!(err.to_string().contains("no index"));
}

#[test]
fn concurrent_saves_to_one_key_never_collide() {
    let store = Arc::new(store());
    let threads = 8;
    let per_thread = 5;

    std::thread::scope(|scope| {
        for t in 0..threads {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for i in 0..per_thread {
                    let mut task =
                        Task::new("main", "shared", "alice", &format!("t{}-i{}", t, i));
                    store.save(&mut task).unwrap();
                }
            });
        }
    });

    let gens: Vec<u64> = store
        .get_generations("main", "task", "shared")
        .unwrap()
        .iter()
        .map(|o| o.generation().0)
        .collect();
    let expected: Vec<u64> = (1..=(threads * per_thread) as u64).collect();
    assert_eq!(gens, expected, "generations must be contiguous with no repeats");
}

#[test]
fn memory_driver_is_at_least_as_fresh_as_returned_saves() {
    let driver = Arc::new(MemoryDriver::new());
    let store = ObjectStore::new(Arc::clone(&driver) as Arc<dyn Driver>, catalog());
    let mut t = Task::new("main", "svc1", "alice", "v1");
    store.save(&mut t).unwrap();
    // The persisted snapshot exists as soon as save returns.
    assert!(driver
        .get("main:task:svc1:00000000000000000001")
        .unwrap()
        .is_some());
}
