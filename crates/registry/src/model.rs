//! Engine-owned runtime objects: the policy manifest, revisions and persisted
//! desired state. All live in the system namespace.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use verge_apply::{ApplyResult, EventEntry};
use verge_core::{Generation, Storable, EMPTY_NAME, SYSTEM_NS};

pub const POLICY_DATA_KIND: &str = "policy";
pub const REVISION_KIND: &str = "revision";
pub const DESIRED_STATE_KIND: &str = "desired-state";

/// Manifest of one policy version: which generation of each object the policy
/// is made of. The objects themselves are stored separately; this is only the
/// membership map, keyed namespace -> kind -> name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyData {
    #[serde(default)]
    pub generation: Generation,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    #[serde(default)]
    pub objects: BTreeMap<String, BTreeMap<String, BTreeMap<String, Generation>>>,
}

impl PolicyData {
    pub fn new(updated_by: &str) -> Self {
        Self {
            generation: Generation::LAST,
            deleted: false,
            updated_at: Utc::now(),
            updated_by: updated_by.to_string(),
            objects: BTreeMap::new(),
        }
    }

    /// Records the object's current generation in the manifest, replacing any
    /// previous generation of the same object.
    pub fn add(&mut self, obj: &dyn Storable) {
        self.objects
            .entry(obj.namespace().to_string())
            .or_default()
            .entry(obj.kind().to_string())
            .or_default()
            .insert(obj.name(), obj.generation());
    }

    /// Removes the object from the manifest. Returns `false` when it wasn't a
    /// member.
    pub fn remove(&mut self, obj: &dyn Storable) -> bool {
        let Some(by_kind) = self.objects.get_mut(obj.namespace()) else {
            return false;
        };
        let Some(by_name) = by_kind.get_mut(obj.kind()) else {
            return false;
        };
        let removed = by_name.remove(&obj.name()).is_some();
        if by_name.is_empty() {
            by_kind.remove(obj.kind());
        }
        if by_kind.is_empty() {
            self.objects.remove(obj.namespace());
        }
        removed
    }

    pub fn contains(&self, obj: &dyn Storable) -> bool {
        self.objects
            .get(obj.namespace())
            .and_then(|by_kind| by_kind.get(obj.kind()))
            .map(|by_name| by_name.contains_key(&obj.name()))
            .unwrap_or(false)
    }

    pub fn object_count(&self) -> usize {
        self.objects
            .values()
            .flat_map(|by_kind| by_kind.values())
            .map(|by_name| by_name.len())
            .sum()
    }
}

impl Storable for PolicyData {
    fn kind(&self) -> &'static str {
        POLICY_DATA_KIND
    }

    fn namespace(&self) -> &str {
        SYSTEM_NS
    }

    fn name(&self) -> String {
        EMPTY_NAME.to_string()
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

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Waiting,
    #[serde(rename = "inprogress")]
    InProgress,
    Completed,
    Error,
}

impl fmt::Display for RevisionStatus {
    /// Matches the serde representation, so displayed and stored status
    /// strings can't drift apart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RevisionStatus::Waiting => "waiting",
            RevisionStatus::InProgress => "inprogress",
            RevisionStatus::Completed => "completed",
            RevisionStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One apply attempt of one policy generation. Revisions form a single
/// generation sequence under `system:revision:` and are processed FIFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    #[serde(default)]
    pub generation: Generation,
    #[serde(default)]
    pub deleted: bool,
    /// Policy manifest generation this revision applies.
    pub policy_gen: Generation,
    pub status: RevisionStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Forces every action to re-run even when desired and actual state agree.
    #[serde(default)]
    pub recalculate_all: bool,
    #[serde(default)]
    pub result: ApplyResult,
    #[serde(default)]
    pub apply_log: Vec<EventEntry>,
}

impl Revision {
    pub fn new(policy_gen: Generation, recalculate_all: bool) -> Self {
        Self {
            generation: Generation::LAST,
            deleted: false,
            policy_gen,
            status: RevisionStatus::Waiting,
            created_at: Utc::now(),
            applied_at: None,
            recalculate_all,
            result: ApplyResult::default(),
            apply_log: Vec::new(),
        }
    }

    /// Terminal revisions are never picked up for processing again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RevisionStatus::Completed | RevisionStatus::Error)
    }
}

impl Storable for Revision {
    fn kind(&self) -> &'static str {
        REVISION_KIND
    }

    fn namespace(&self) -> &str {
        SYSTEM_NS
    }

    fn name(&self) -> String {
        EMPTY_NAME.to_string()
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

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Storage name of the desired state computed for one revision.
pub fn desired_state_name(revision_gen: Generation) -> String {
    format!("revision-{}-desired-state", revision_gen)
}

/// Resolved desired state of one revision, persisted so the applier (and a
/// restarted engine) can reload exactly what was resolved. Non-versioned: one
/// revision has exactly one desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub generation: Generation,
    #[serde(default)]
    pub deleted: bool,
    pub revision_gen: Generation,
    pub resolution: verge_core::PolicyResolution,
}

impl DesiredState {
    pub fn new(revision_gen: Generation, resolution: verge_core::PolicyResolution) -> Self {
        Self {
            generation: Generation::LAST,
            deleted: false,
            revision_gen,
            resolution,
        }
    }
}

impl Storable for DesiredState {
    fn kind(&self) -> &'static str {
        DESIRED_STATE_KIND
    }

    fn namespace(&self) -> &str {
        SYSTEM_NS
    }

    fn name(&self) -> String {
        desired_state_name(self.revision_gen)
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

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
