//! Verge apply framework: the action sum type, execution context, plugin
//! seams and the parallel apply engine that drives actual state toward
//! desired state.

#![forbid(unsafe_code)]

pub mod action;
pub mod context;
pub mod engine;
pub mod event;
pub mod plugin;

pub use action::{Action, ActionMeta, ApplyResult, ApplyResultUpdater, StateUpdater};
pub use context::{Context, ExternalData, NoopExternalData};
pub use engine::ApplyEngine;
pub use event::{EventEntry, EventLevel, EventLog};
pub use plugin::{DeployPlugin, PluginRegistry, PostProcessPlugin};
