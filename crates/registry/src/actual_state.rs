//! Actual state: the live component-instance map, persisted per mutation and
//! published to memory only after the store write succeeds.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;

use verge_apply::StateUpdater;
use verge_core::{
    ComponentInstance, Generation, PolicyResolution, COMPONENT_INSTANCE_KIND, SYSTEM_NS,
};

use crate::{downcast, Registry};

impl Registry {
    /// Reconstructs the actual state from the store: the latest generation of
    /// every component instance, tombstones skipped.
    pub fn get_actual_state(&self) -> Result<PolicyResolution> {
        let mut resolution = PolicyResolution::new();
        for obj in self
            .store
            .get_all(SYSTEM_NS, COMPONENT_INSTANCE_KIND)
            .context("while loading actual state")?
        {
            if obj.is_deleted() {
                continue;
            }
            resolution.insert(downcast(obj)?);
        }
        Ok(resolution)
    }

    pub fn new_actual_state_updater(
        self: &Arc<Self>,
        actual_state: PolicyResolution,
    ) -> ActualStateUpdater {
        ActualStateUpdater {
            registry: Arc::clone(self),
            state: Mutex::new(actual_state),
        }
    }
}

/// Implements [`StateUpdater`] over the store. Every mutation persists first
/// and publishes to the in-memory map second, so an acknowledged write is
/// never lost and a failed one is never visible.
pub struct ActualStateUpdater {
    registry: Arc<Registry>,
    state: Mutex<PolicyResolution>,
}

impl ActualStateUpdater {
    fn load(&self, key: &str) -> Result<ComponentInstance> {
        let obj = self
            .registry
            .store
            .get_by_name(SYSTEM_NS, COMPONENT_INSTANCE_KIND, key, Generation::LAST)?
            .ok_or_else(|| {
                anyhow!("component instance '{}' doesn't exist in the store", key)
            })?;
        // Only component instances flow through this updater; the typed
        // catalog enforces it, downcast turns corruption into an error.
        downcast(obj)
    }
}

impl StateUpdater for ActualStateUpdater {
    fn get(&self, key: &str) -> Option<ComponentInstance> {
        self.state.lock().unwrap().get(key).cloned()
    }

    fn create(&self, mut instance: ComponentInstance) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        instance.created_at = now;
        instance.updated_at = now;
        self.registry
            .store
            .save(&mut instance)
            .with_context(|| format!("while saving component instance '{}'", instance.instance_key()))?;
        state.insert(instance);
        Ok(())
    }

    fn update(&self, key: &str, mutate: &dyn Fn(&mut ComponentInstance)) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut instance = self.load(key)?;
        mutate(&mut instance);
        instance.updated_at = Utc::now();
        self.registry
            .store
            .save(&mut instance)
            .with_context(|| format!("while saving component instance '{}'", key))?;
        state.insert(instance);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.registry
            .store
            .delete(SYSTEM_NS, COMPONENT_INSTANCE_KIND, key)
            .with_context(|| format!("while tombstoning component instance '{}'", key))?;
        state.remove(key);
        Ok(())
    }

    fn snapshot(&self) -> PolicyResolution {
        self.state.lock().unwrap().clone()
    }
}
