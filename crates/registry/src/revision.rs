//! Revision lifecycle: creation, FIFO pickup, per-policy queries and the
//! persisted desired state that travels with each revision.

use anyhow::{anyhow, Context as _, Result};
use tracing::info;

use verge_core::{Generation, PolicyResolution, EMPTY_NAME, SYSTEM_NS};

use crate::model::{desired_state_name, DesiredState, Revision, RevisionStatus};
use crate::model::{DESIRED_STATE_KIND, REVISION_KIND};
use crate::{downcast, Registry};

impl Registry {
    /// Loads one revision, `Generation::LAST` for the most recent.
    pub fn get_revision(&self, gen: Generation) -> Result<Option<Revision>> {
        match self
            .store
            .get_by_name(SYSTEM_NS, REVISION_KIND, EMPTY_NAME, gen)
            .context("while loading revision")?
        {
            Some(obj) => Ok(Some(downcast(obj)?)),
            None => Ok(None),
        }
    }

    /// Creates a new waiting revision for `policy_gen` and persists the
    /// desired state resolved for it. The store assigns the revision's
    /// generation; the desired state is named after it.
    pub fn new_revision(
        &self,
        policy_gen: Generation,
        resolution: PolicyResolution,
        recalculate_all: bool,
    ) -> Result<Revision> {
        // Forced: back-to-back revisions for the same policy may be
        // content-equal, and each must still get its own generation.
        let mut revision = Revision::new(policy_gen, recalculate_all);
        self.store
            .save_new_generation(&mut revision)
            .context("while saving new revision")?;

        let mut desired = DesiredState::new(revision.generation, resolution);
        self.store
            .save(&mut desired)
            .context("while saving desired state for new revision")?;

        info!(
            revision = %revision.generation,
            policy = %policy_gen,
            "created revision"
        );
        Ok(revision)
    }

    /// Writes a revision back at its current generation. Used for status
    /// transitions and write-through progress updates.
    pub fn update_revision(&self, revision: &Revision) -> Result<()> {
        self.store
            .update(revision)
            .with_context(|| format!("while updating revision {}", revision.generation))
    }

    /// Oldest revision that is still waiting or in progress, if any. In
    /// progress counts as unprocessed so an engine restart resumes the
    /// interrupted revision instead of jumping past it.
    pub fn get_first_unprocessed_revision(&self) -> Result<Option<Revision>> {
        for obj in self
            .store
            .get_generations(SYSTEM_NS, REVISION_KIND, EMPTY_NAME)?
        {
            let revision: Revision = downcast(obj)?;
            if !revision.is_terminal() {
                return Ok(Some(revision));
            }
        }
        Ok(None)
    }

    /// All revisions ever created for one policy generation, ascending.
    pub fn get_all_revisions_for_policy(&self, policy_gen: Generation) -> Result<Vec<Revision>> {
        let objs = self
            .store
            .find_by_index(REVISION_KIND, "policy", &policy_gen.as_store_suffix())
            .context("while querying revisions by policy")?;
        objs.into_iter().map(downcast).collect()
    }

    /// Most recent revision for one policy generation, if any.
    pub fn get_last_revision_for_policy(
        &self,
        policy_gen: Generation,
    ) -> Result<Option<Revision>> {
        Ok(self
            .get_all_revisions_for_policy(policy_gen)?
            .into_iter()
            .last())
    }

    /// Every revision in creation order. Each generation is a distinct
    /// revision, so this is the full history.
    pub fn get_all_revisions(&self) -> Result<Vec<Revision>> {
        self.store
            .get_generations(SYSTEM_NS, REVISION_KIND, EMPTY_NAME)?
            .into_iter()
            .map(downcast)
            .collect()
    }

    /// Desired state persisted for `revision`. Missing desired state for an
    /// existing revision is an error: the applier can't proceed without it.
    pub fn get_desired_state(&self, revision: &Revision) -> Result<PolicyResolution> {
        let name = desired_state_name(revision.generation);
        let obj = self
            .store
            .get_by_name(SYSTEM_NS, DESIRED_STATE_KIND, &name, Generation::LAST)
            .context("while loading desired state")?
            .ok_or_else(|| {
                anyhow!(
                    "unable to load desired state for revision {}",
                    revision.generation
                )
            })?;
        let desired: DesiredState = downcast(obj)?;
        Ok(desired.resolution)
    }

    /// Marks a revision failed outside of action accounting, e.g. when its
    /// desired state can't be loaded.
    pub fn mark_revision_error(&self, revision: &mut Revision) -> Result<()> {
        revision.status = RevisionStatus::Error;
        self.update_revision(revision)
    }
}
