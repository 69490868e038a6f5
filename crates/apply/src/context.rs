//! Shared context every action executes against.

use std::sync::Arc;

use verge_core::{Policy, PolicyResolution};

use crate::action::StateUpdater;
use crate::event::EventLog;
use crate::plugin::PluginRegistry;

/// External data provider (user directory, secrets). The engine core only
/// threads it through to actions and plugins.
pub trait ExternalData: Send + Sync {
    fn lookup(&self, namespace: &str, name: &str) -> Option<serde_json::Value>;
}

/// Default provider for deployments without external data.
pub struct NoopExternalData;

impl ExternalData for NoopExternalData {
    fn lookup(&self, _namespace: &str, _name: &str) -> Option<serde_json::Value> {
        None
    }
}

/// Everything an action needs: the desired policy and state it converges
/// toward, the guarded view of actual state, plugins and the event log.
pub struct Context {
    pub desired_policy: Arc<Policy>,
    pub desired_state: Arc<PolicyResolution>,
    pub actual_state: Arc<dyn StateUpdater>,
    pub external: Arc<dyn ExternalData>,
    pub plugins: Arc<PluginRegistry>,
    pub event_log: Arc<EventLog>,
}

impl Context {
    pub fn new(
        desired_policy: Arc<Policy>,
        desired_state: Arc<PolicyResolution>,
        actual_state: Arc<dyn StateUpdater>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            desired_policy,
            desired_state,
            actual_state,
            external: Arc::new(NoopExternalData),
            plugins,
            event_log: Arc::new(EventLog::new()),
        }
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalData>) -> Self {
        self.external = external;
        self
    }
}
