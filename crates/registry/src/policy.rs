//! Policy manifest operations: bootstrap, reconstruction, update and delete.

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use tracing::info;

use verge_core::{
    key_for_storable, key_from_parts, Generation, Policy, PolicyResolution, Storable, EMPTY_NAME,
    SYSTEM_NS,
};

use crate::model::{PolicyData, POLICY_DATA_KIND};
use crate::{downcast, Registry};

impl Registry {
    /// Loads one generation of the policy manifest, `Generation::LAST` for the
    /// most recent. `None` when the registry was never initialized.
    pub fn get_policy_data(&self, gen: Generation) -> Result<Option<PolicyData>> {
        match self
            .store
            .get_by_name(SYSTEM_NS, POLICY_DATA_KIND, EMPTY_NAME, gen)
            .context("while loading policy data")?
        {
            Some(obj) => Ok(Some(downcast(obj)?)),
            None => Ok(None),
        }
    }

    /// Reconstructs the full policy for one manifest generation. Before the
    /// registry is initialized this returns an empty policy with
    /// `Generation::LAST` so read paths never special-case bootstrap.
    pub fn get_policy(&self, gen: Generation) -> Result<(Policy, Generation)> {
        match self.get_policy_data(gen)? {
            Some(data) => self.policy_from_data(&data),
            None => Ok((Policy::new(), Generation::LAST)),
        }
    }

    fn policy_from_data(&self, data: &PolicyData) -> Result<(Policy, Generation)> {
        let mut policy = Policy::new();
        for (namespace, by_kind) in &data.objects {
            for (kind, by_name) in by_kind {
                for (name, gen) in by_name {
                    let obj = self
                        .store
                        .get_by_name(namespace, kind, name, *gen)?
                        .ok_or_else(|| {
                            anyhow!(
                                "policy generation {} refers to missing snapshot {}@{}",
                                data.generation,
                                key_from_parts(namespace, kind, name),
                                gen
                            )
                        })?;
                    policy.add_object(Arc::from(obj))?;
                }
            }
        }
        Ok((policy, data.generation))
    }

    /// Creates the first (empty) policy manifest and its first revision.
    /// Returns `false` without touching anything when already initialized.
    pub fn init_policy(&self) -> Result<bool> {
        let _guard = self.policy_change_lock.lock().unwrap();
        if self.get_policy_data(Generation::LAST)?.is_some() {
            return Ok(false);
        }
        let mut data = PolicyData::new("verge");
        self.store
            .save(&mut data)
            .context("while saving initial policy data")?;
        self.new_revision(data.generation, PolicyResolution::new(), false)
            .context("while creating initial revision")?;
        info!(gen = %data.generation, "initialized policy");
        Ok(true)
    }

    /// Saves the given objects and records the new generation of each changed
    /// one in the manifest. Objects carry their assigned generations on
    /// return. Returns whether anything changed, plus the current manifest.
    ///
    /// Panics when called before [`Registry::init_policy`]: that is an engine
    /// wiring bug, not a runtime condition.
    pub fn update_policy(
        &self,
        updated: &mut [Box<dyn Storable>],
        performed_by: &str,
    ) -> Result<(bool, PolicyData)> {
        let _guard = self.policy_change_lock.lock().unwrap();
        let mut data = self.latest_policy_data_or_panic()?;

        let mut changed = false;
        for obj in updated.iter_mut() {
            if obj.is_deleted() {
                return Err(anyhow!(
                    "objects with deleted flag set can't be updated in the policy: {}",
                    key_for_storable(obj.as_ref())
                ));
            }
            let obj_changed = self
                .store
                .save(obj.as_mut())
                .with_context(|| format!("while saving {}", key_for_storable(obj.as_ref())))?;
            // An unchanged object may still be absent from the manifest, e.g.
            // re-adding one that was previously deleted from the policy.
            if obj_changed || !data.contains(obj.as_ref()) {
                data.add(obj.as_ref());
                changed = true;
            }
        }

        if changed {
            data.updated_at = Utc::now();
            data.updated_by = performed_by.to_string();
            self.store
                .save(&mut data)
                .context("while saving updated policy data")?;
            info!(gen = %data.generation, by = performed_by, "updated policy");
        }
        Ok((changed, data))
    }

    /// Removes the given objects from the manifest and tombstones their
    /// stored snapshots. Manifest membership is dropped before the tombstone
    /// is written and the manifest is committed last, so a crash in between
    /// can only leave a tombstoned object that no policy references.
    pub fn delete_from_policy(
        &self,
        deleted: &[Box<dyn Storable>],
        performed_by: &str,
    ) -> Result<(bool, PolicyData)> {
        let _guard = self.policy_change_lock.lock().unwrap();
        let mut data = self.latest_policy_data_or_panic()?;

        let mut changed = false;
        for obj in deleted {
            if data.remove(obj.as_ref()) {
                changed = true;
            }
            self.store
                .delete(obj.namespace(), obj.kind(), &obj.name())
                .with_context(|| {
                    format!("while tombstoning {}", key_for_storable(obj.as_ref()))
                })?;
        }

        if changed {
            data.updated_at = Utc::now();
            data.updated_by = performed_by.to_string();
            self.store
                .save(&mut data)
                .context("while saving updated policy data")?;
            info!(gen = %data.generation, by = performed_by, "deleted objects from policy");
        }
        Ok((changed, data))
    }

    fn latest_policy_data_or_panic(&self) -> Result<PolicyData> {
        match self.get_policy_data(Generation::LAST)? {
            Some(data) => Ok(data),
            None => panic!("policy data not found in the registry, init_policy was never called"),
        }
    }
}
