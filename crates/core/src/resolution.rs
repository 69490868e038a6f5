//! Component instances and the resolved component graph. The same shape is
//! used both for the desired state of a revision and for the live actual state.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Generation, Storable, SYSTEM_NS};

/// Kind under which component instances are persisted (system namespace).
pub const COMPONENT_INSTANCE_KIND: &str = "component-instance";

/// Identity of one concrete running unit: a service component bound to a
/// label context.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ComponentKey {
    pub namespace: String,
    pub service: String,
    pub component: String,
    pub context: String,
}

impl ComponentKey {
    pub fn new(namespace: &str, service: &str, component: &str, context: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            service: service.to_string(),
            component: component.to_string(),
            context: context.to_string(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.namespace, self.service, self.component, self.context
        )
    }
}

/// One running component instance with its calculated parameters and
/// dependency links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub key: ComponentKey,
    #[serde(default)]
    pub generation: Generation,
    #[serde(default)]
    pub deleted: bool,

    /// Code type handled by a deploy plugin; `None` for service-level
    /// instances that have nothing to deploy.
    pub code_type: Option<String>,
    pub calculated_params: serde_json::Value,

    /// Ids of claims/dependencies currently attached to this instance.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoints_up_to_date: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentInstance {
    pub fn new(key: ComponentKey, code_type: Option<String>, calculated_params: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            key,
            generation: Generation::LAST,
            deleted: false,
            code_type,
            calculated_params,
            depends_on: BTreeSet::new(),
            endpoints: BTreeMap::new(),
            endpoints_up_to_date: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Map key under which this instance appears in a `PolicyResolution`.
    pub fn instance_key(&self) -> String {
        self.key.to_string()
    }

    /// Name handed to deploy plugins for the underlying workload.
    pub fn deploy_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.key.service, self.key.component, self.key.context
        )
    }

    /// Cluster this instance is pinned to, taken from calculated parameters.
    pub fn cluster(&self) -> Option<&str> {
        self.calculated_params.get("cluster").and_then(|v| v.as_str())
    }
}

impl Storable for ComponentInstance {
    fn kind(&self) -> &'static str {
        COMPONENT_INSTANCE_KIND
    }

    fn namespace(&self) -> &str {
        SYSTEM_NS
    }

    fn name(&self) -> String {
        self.key.to_string()
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

/// Resolved component graph: component-instance key to instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyResolution {
    pub component_instances: BTreeMap<String, ComponentInstance>,
}

impl PolicyResolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ComponentInstance> {
        self.component_instances.get(key)
    }

    pub fn insert(&mut self, instance: ComponentInstance) {
        self.component_instances.insert(instance.instance_key(), instance);
    }

    pub fn remove(&mut self, key: &str) -> Option<ComponentInstance> {
        self.component_instances.remove(key)
    }

    pub fn len(&self) -> usize {
        self.component_instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.component_instances.is_empty()
    }
}
