//! Write-through progress sink for one revision's apply cycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use verge_apply::{ApplyResult, ApplyResultUpdater, EventEntry};

use crate::model::{Revision, RevisionStatus};
use crate::Registry;

/// Implements [`ApplyResultUpdater`] over a stored revision. Counters are
/// lock-free; every mutation re-persists the revision under the revision
/// mutex so progress survives a crash mid-apply.
pub struct RevisionResultUpdater {
    registry: Arc<Registry>,
    revision: Mutex<Revision>,
    total: AtomicU32,
    success: AtomicU32,
    failed: AtomicU32,
    skipped: AtomicU32,
}

impl Registry {
    /// Counters are seeded from the revision's stored result, so resuming an
    /// interrupted revision continues its accounting instead of resetting it.
    pub fn new_revision_result_updater(
        self: &Arc<Self>,
        revision: Revision,
    ) -> RevisionResultUpdater {
        let result = revision.result;
        RevisionResultUpdater {
            registry: Arc::clone(self),
            revision: Mutex::new(revision),
            total: AtomicU32::new(result.total),
            success: AtomicU32::new(result.success),
            failed: AtomicU32::new(result.failed),
            skipped: AtomicU32::new(result.skipped),
        }
    }
}

impl RevisionResultUpdater {
    fn snapshot(&self) -> ApplyResult {
        ApplyResult {
            total: self.total.load(Ordering::SeqCst),
            success: self.success.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }

    /// Persists the revision with the current counters. Callers hold the
    /// revision lock, which also serializes the in-place store writes.
    fn persist(&self, revision: &mut Revision) {
        revision.result = self.snapshot();
        if let Err(err) = self.registry.update_revision(revision) {
            panic!(
                "error while saving revision {}: {:#}",
                revision.generation, err
            );
        }
    }

    fn bump(&self, counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut revision = self.revision.lock().unwrap();
        self.persist(&mut revision);
    }
}

impl ApplyResultUpdater for RevisionResultUpdater {
    fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::SeqCst);
        let mut revision = self.revision.lock().unwrap();
        revision.status = RevisionStatus::InProgress;
        self.persist(&mut revision);
    }

    fn add_success(&self) {
        self.bump(&self.success);
    }

    fn add_failed(&self) {
        self.bump(&self.failed);
    }

    fn add_skipped(&self) {
        self.bump(&self.skipped);
    }

    fn append_log(&self, entries: Vec<EventEntry>) {
        let mut revision = self.revision.lock().unwrap();
        revision.apply_log.extend(entries);
        self.persist(&mut revision);
    }

    fn done(&self) -> ApplyResult {
        let result = self.snapshot();
        if result.success + result.failed + result.skipped != result.total {
            panic!(
                "error in revision result: {} (success) + {} (failed) + {} (skipped) != {} (total)",
                result.success, result.failed, result.skipped, result.total
            );
        }
        let mut revision = self.revision.lock().unwrap();
        revision.status = RevisionStatus::Completed;
        revision.applied_at = Some(Utc::now());
        self.persist(&mut revision);
        result
    }
}
