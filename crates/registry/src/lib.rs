//! Verge runtime registry: typed access to the policy manifest, revisions,
//! desired state and the live component-instance map, layered over the
//! versioned object store.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use verge_core::{
    Catalog, ComponentInstance, IndexDescriptor, Storable, TypeInfo, COMPONENT_INSTANCE_KIND,
};
use verge_store::{Driver, ObjectStore};

pub mod actual_state;
pub mod model;
pub mod policy;
pub mod result_updater;
pub mod revision;

pub use actual_state::ActualStateUpdater;
pub use model::{
    desired_state_name, DesiredState, PolicyData, Revision, RevisionStatus, DESIRED_STATE_KIND,
    POLICY_DATA_KIND, REVISION_KIND,
};
pub use result_updater::RevisionResultUpdater;

/// Catalog entries for every engine-owned kind. Callers append their own
/// application kinds (services, contracts, clusters and so on) before handing
/// the list to [`Registry::new`].
pub fn runtime_types() -> Vec<TypeInfo> {
    vec![
        TypeInfo::new::<PolicyData>(POLICY_DATA_KIND, true),
        TypeInfo::new::<Revision>(REVISION_KIND, true).with_index(IndexDescriptor {
            field: "policy",
            extract: |obj| {
                obj.as_any()
                    .downcast_ref::<Revision>()
                    .map(|rev| rev.policy_gen.as_store_suffix())
            },
        }),
        TypeInfo::new::<DesiredState>(DESIRED_STATE_KIND, false),
        TypeInfo::new::<ComponentInstance>(COMPONENT_INSTANCE_KIND, true),
    ]
}

/// The runtime registry. One instance per engine process; all policy changes
/// are serialized through `policy_change_lock` so manifest reads and writes
/// can never interleave.
pub struct Registry {
    pub(crate) store: ObjectStore,
    pub(crate) policy_change_lock: Mutex<()>,
}

impl Registry {
    /// Builds a registry over `driver`, registering the runtime kinds plus the
    /// caller's application kinds.
    pub fn new(driver: Arc<dyn Driver>, app_types: Vec<TypeInfo>) -> Self {
        let mut catalog = Catalog::new();
        for info in runtime_types() {
            catalog.register(info);
        }
        for info in app_types {
            catalog.register(info);
        }
        Self {
            store: ObjectStore::new(driver, catalog),
            policy_change_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }
}

/// Downcasts a decoded store object into its concrete type. The catalog
/// guarantees kind/type agreement, so a failure here means a corrupted row.
pub(crate) fn downcast<T: Clone + 'static>(obj: Box<dyn Storable>) -> Result<T> {
    let kind = obj.kind();
    obj.as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| anyhow!("decoded object has unexpected kind '{}'", kind))
}
