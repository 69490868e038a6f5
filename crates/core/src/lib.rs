//! Verge core runtime types: generations, storage keys, the `Storable` trait
//! and the type catalog shared by the store and the registry.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod policy;
pub mod resolution;

pub use catalog::{Catalog, IndexDescriptor, TypeInfo};
pub use policy::Policy;
pub use resolution::{ComponentInstance, ComponentKey, PolicyResolution, COMPONENT_INSTANCE_KIND};

/// Namespace for engine-owned objects (policy manifest, revisions, actual state).
pub const SYSTEM_NS: &str = "system";

/// Name for singleton objects that exist once per kind (with many generations).
pub const EMPTY_NAME: &str = "";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("contract violation: {0}")]
    Contract(String),
}

/// Monotonic version counter for one object key.
///
/// `LAST` (0) is a sentinel: "most recent" on reads, "assign next" on writes.
/// Real generations start at `FIRST` (1) and are never reused or decremented.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub const LAST: Generation = Generation(0);
    pub const FIRST: Generation = Generation(1);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }

    pub fn is_last(self) -> bool {
        self == Generation::LAST
    }

    /// Fixed-width form used in storage keys so that lexicographic order of
    /// keys matches numeric order of generations.
    pub fn as_store_suffix(self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Any value the object store can persist. Object-safe on purpose: the store,
/// the policy manifest and the registry all operate on `dyn Storable` and only
/// downcast at well-defined seams.
pub trait Storable: Any + Send + Sync + fmt::Debug {
    fn kind(&self) -> &'static str;
    fn namespace(&self) -> &str;
    fn name(&self) -> String;
    fn generation(&self) -> Generation;
    fn set_generation(&mut self, gen: Generation);
    fn is_deleted(&self) -> bool;
    fn set_deleted(&mut self, deleted: bool);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Builds the `namespace:kind:name` key addressing all generations of one object.
pub fn key_from_parts(namespace: &str, kind: &str, name: &str) -> String {
    format!("{}:{}:{}", namespace, kind, name)
}

/// Key for a storable object, derived from its identity fields.
pub fn key_for_storable(obj: &dyn Storable) -> String {
    key_from_parts(obj.namespace(), obj.kind(), &obj.name())
}

/// Full storage key addressing one immutable snapshot.
pub fn storage_key(key: &str, gen: Generation) -> String {
    format!("{}:{}", key, gen.as_store_suffix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_starts_at_one_and_increments() {
        assert_eq!(Generation::FIRST, Generation(1));
        assert_eq!(Generation::FIRST.next(), Generation(2));
        assert!(Generation::LAST.is_last());
        assert!(!Generation::FIRST.is_last());
    }

    #[test]
    fn generation_suffix_sorts_numerically() {
        let g9 = Generation(9).as_store_suffix();
        let g10 = Generation(10).as_store_suffix();
        let g100 = Generation(100).as_store_suffix();
        assert!(g9 < g10);
        assert!(g10 < g100);
        assert_eq!(g9.len(), 20);
    }

    #[test]
    fn generation_serde_is_transparent() {
        let json = serde_json::to_string(&Generation(7)).unwrap();
        assert_eq!(json, "7");
        let back: Generation = serde_json::from_str("7").unwrap();
        assert_eq!(back, Generation(7));
    }

    #[test]
    fn key_layout() {
        assert_eq!(key_from_parts("main", "service", "svc1"), "main:service:svc1");
        assert_eq!(
            storage_key("main:service:svc1", Generation(1)),
            "main:service:svc1:00000000000000000001"
        );
    }
}
