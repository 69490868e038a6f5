//! Actions: one unit of reconciliation work, modeled as a sum type dispatched
//! through a single `apply(context)` entry point.

use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use verge_core::{ComponentInstance, Generation, PolicyResolution};

use crate::context::Context;
use crate::event::EventEntry;

/// Counters describing the outcome of one apply cycle. Must satisfy
/// `success + failed + skipped == total` once the cycle settles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Progress/result sink for one revision. Counter methods may be called
/// concurrently from many worker threads; every mutation is persisted
/// write-through by the implementation.
pub trait ApplyResultUpdater: Send + Sync {
    /// Sets the expected action count and marks the revision in progress.
    fn set_total(&self, total: u32);
    fn add_success(&self);
    fn add_failed(&self);
    fn add_skipped(&self);
    /// Appends apply events to the revision's log.
    fn append_log(&self, entries: Vec<EventEntry>);
    /// Asserts the counter invariant and marks the revision completed.
    /// Panics on a mismatch: it means an action reported twice or never.
    fn done(&self) -> ApplyResult;
}

/// Guarded view of the live component-instance map. Implementations persist
/// before publishing to memory, so a crash never loses an acknowledged write.
pub trait StateUpdater: Send + Sync {
    fn get(&self, key: &str) -> Option<ComponentInstance>;
    fn create(&self, instance: ComponentInstance) -> Result<()>;
    fn update(&self, key: &str, mutate: &dyn Fn(&mut ComponentInstance)) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Snapshot of the updated actual state.
    fn snapshot(&self) -> PolicyResolution;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMeta {
    /// Generation of the revision this action belongs to.
    pub revision: Generation,
    pub kind: &'static str,
    pub name: String,
}

impl ActionMeta {
    fn new(revision: Generation, kind: &'static str, target: &str) -> Self {
        Self {
            revision,
            kind,
            name: format!("{}/{}", kind, target),
        }
    }
}

/// One unit of reconciliation work. Immutable once constructed; applied
/// exactly once against a `Context`.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateComponent {
        meta: ActionMeta,
        component_key: String,
    },
    UpdateComponent {
        meta: ActionMeta,
        component_key: String,
    },
    DeleteComponent {
        meta: ActionMeta,
        component_key: String,
    },
    AttachDependency {
        meta: ActionMeta,
        component_key: String,
        dependency_id: String,
    },
    DetachDependency {
        meta: ActionMeta,
        component_key: String,
        dependency_id: String,
    },
    Endpoints {
        meta: ActionMeta,
        component_key: String,
    },
    PostProcess {
        meta: ActionMeta,
    },
}

impl Action {
    pub fn create_component(revision: Generation, component_key: &str) -> Self {
        Action::CreateComponent {
            meta: ActionMeta::new(revision, "action-component-create", component_key),
            component_key: component_key.to_string(),
        }
    }

    pub fn update_component(revision: Generation, component_key: &str) -> Self {
        Action::UpdateComponent {
            meta: ActionMeta::new(revision, "action-component-update", component_key),
            component_key: component_key.to_string(),
        }
    }

    pub fn delete_component(revision: Generation, component_key: &str) -> Self {
        Action::DeleteComponent {
            meta: ActionMeta::new(revision, "action-component-delete", component_key),
            component_key: component_key.to_string(),
        }
    }

    pub fn attach_dependency(revision: Generation, component_key: &str, dependency_id: &str) -> Self {
        Action::AttachDependency {
            meta: ActionMeta::new(revision, "action-dependency-attach", component_key),
            component_key: component_key.to_string(),
            dependency_id: dependency_id.to_string(),
        }
    }

    pub fn detach_dependency(revision: Generation, component_key: &str, dependency_id: &str) -> Self {
        Action::DetachDependency {
            meta: ActionMeta::new(revision, "action-dependency-detach", component_key),
            component_key: component_key.to_string(),
            dependency_id: dependency_id.to_string(),
        }
    }

    pub fn endpoints(revision: Generation, component_key: &str) -> Self {
        Action::Endpoints {
            meta: ActionMeta::new(revision, "action-component-endpoints", component_key),
            component_key: component_key.to_string(),
        }
    }

    pub fn post_process(revision: Generation) -> Self {
        Action::PostProcess {
            meta: ActionMeta::new(revision, "action-post-process", "global"),
        }
    }

    pub fn meta(&self) -> &ActionMeta {
        match self {
            Action::CreateComponent { meta, .. }
            | Action::UpdateComponent { meta, .. }
            | Action::DeleteComponent { meta, .. }
            | Action::AttachDependency { meta, .. }
            | Action::DetachDependency { meta, .. }
            | Action::Endpoints { meta, .. }
            | Action::PostProcess { meta } => meta,
        }
    }

    /// Component instance this action targets; `None` for global actions.
    pub fn component_key(&self) -> Option<&str> {
        match self {
            Action::CreateComponent { component_key, .. }
            | Action::UpdateComponent { component_key, .. }
            | Action::DeleteComponent { component_key, .. }
            | Action::AttachDependency { component_key, .. }
            | Action::DetachDependency { component_key, .. }
            | Action::Endpoints { component_key, .. } => Some(component_key),
            Action::PostProcess { .. } => None,
        }
    }

    /// Applies the action against the shared context. Exactly one call per
    /// action per apply cycle; the engine reports the outcome.
    pub fn apply(&self, ctx: &Context) -> Result<()> {
        match self {
            Action::CreateComponent { component_key, .. } => apply_create(component_key, ctx),
            Action::UpdateComponent { component_key, .. } => apply_update(component_key, ctx),
            Action::DeleteComponent { component_key, .. } => apply_delete(component_key, ctx),
            Action::AttachDependency {
                component_key,
                dependency_id,
                ..
            } => apply_attach(component_key, dependency_id, ctx),
            Action::DetachDependency {
                component_key,
                dependency_id,
                ..
            } => apply_detach(component_key, dependency_id, ctx),
            Action::Endpoints { component_key, .. } => apply_endpoints(component_key, ctx),
            Action::PostProcess { .. } => apply_post_process(ctx),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.meta().name)
    }
}

fn desired_instance<'a>(ctx: &'a Context, key: &str) -> Result<&'a ComponentInstance> {
    ctx.desired_state
        .get(key)
        .ok_or_else(|| anyhow!("component instance '{}' not found in desired state", key))
}

fn actual_instance(ctx: &Context, key: &str) -> Result<ComponentInstance> {
    ctx.actual_state
        .get(key)
        .ok_or_else(|| anyhow!("component instance '{}' doesn't exist in actual state", key))
}

fn cluster_of(instance: &ComponentInstance) -> Result<&str> {
    instance.cluster().ok_or_else(|| {
        anyhow!(
            "no cluster specified in calculated params for component instance '{}'",
            instance.instance_key()
        )
    })
}

fn apply_create(key: &str, ctx: &Context) -> Result<()> {
    let desired = desired_instance(ctx, key)?;
    if let Some(code_type) = &desired.code_type {
        let plugin = ctx.plugins.deploy(code_type)?;
        let cluster = cluster_of(desired)?;
        ctx.event_log
            .info(format!("deploying new component instance {}", key));
        plugin.create(
            cluster,
            &desired.deploy_name(),
            &desired.calculated_params,
            &ctx.event_log,
        )?;
    }
    ctx.actual_state.create(desired.clone())
}

fn apply_update(key: &str, ctx: &Context) -> Result<()> {
    let desired = desired_instance(ctx, key)?;
    if let Some(code_type) = &desired.code_type {
        let plugin = ctx.plugins.deploy(code_type)?;
        let cluster = cluster_of(desired)?;
        ctx.event_log
            .info(format!("updating component instance {}", key));
        plugin.update(
            cluster,
            &desired.deploy_name(),
            &desired.calculated_params,
            &ctx.event_log,
        )?;
    }
    ctx.actual_state.update(key, &|actual| {
        actual.code_type = desired.code_type.clone();
        actual.calculated_params = desired.calculated_params.clone();
        actual.endpoints_up_to_date = false;
    })
}

fn apply_delete(key: &str, ctx: &Context) -> Result<()> {
    let actual = actual_instance(ctx, key)?;
    if let Some(code_type) = &actual.code_type {
        let plugin = ctx.plugins.deploy(code_type)?;
        let cluster = cluster_of(&actual)?;
        ctx.event_log
            .info(format!("destroying component instance {}", key));
        plugin.destroy(
            cluster,
            &actual.deploy_name(),
            &actual.calculated_params,
            &ctx.event_log,
        )?;
    }
    ctx.actual_state.delete(key)
}

fn apply_attach(key: &str, dependency_id: &str, ctx: &Context) -> Result<()> {
    ctx.actual_state.update(key, &|instance| {
        instance.depends_on.insert(dependency_id.to_string());
    })
}

fn apply_detach(key: &str, dependency_id: &str, ctx: &Context) -> Result<()> {
    ctx.actual_state.update(key, &|instance| {
        instance.depends_on.remove(dependency_id);
    })
}

fn apply_endpoints(key: &str, ctx: &Context) -> Result<()> {
    let actual = actual_instance(ctx, key)?;
    let code_type = actual.code_type.as_ref().ok_or_else(|| {
        anyhow!(
            "retrieving endpoints for non-code component instance '{}' is not supported",
            key
        )
    })?;
    let plugin = ctx.plugins.deploy(code_type)?;
    let cluster = cluster_of(&actual)?;
    ctx.event_log
        .info(format!("getting endpoints for component instance {}", key));
    let endpoints = plugin.endpoints(
        cluster,
        &actual.deploy_name(),
        &actual.calculated_params,
        &ctx.event_log,
    )?;
    ctx.actual_state.update(key, &|instance| {
        instance.endpoints = endpoints.clone();
        instance.endpoints_up_to_date = true;
    })
}

fn apply_post_process(ctx: &Context) -> Result<()> {
    for plugin in ctx.plugins.post_process() {
        plugin.process(ctx)?;
    }
    Ok(())
}
