//! Plugin seams: deployment executors keyed by code type, and global
//! post-processing hooks that run once after all component-level actions.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::context::Context;
use crate::event::EventLog;

/// Deployment executor for one code type (e.g. a Helm adapter). Consumed only
/// through this contract; wire formats are the plugin's business.
pub trait DeployPlugin: Send + Sync {
    fn code_type(&self) -> &str;

    fn create(
        &self,
        cluster: &str,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<()>;

    fn update(
        &self,
        cluster: &str,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<()>;

    fn destroy(
        &self,
        cluster: &str,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<()>;

    fn endpoints(
        &self,
        cluster: &str,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<BTreeMap<String, String>>;
}

/// Global hook invoked by the post-process action after all component-level
/// actions settle (e.g. ingress/route reconciliation).
pub trait PostProcessPlugin: Send + Sync {
    fn process(&self, ctx: &Context) -> Result<()>;
}

#[derive(Default)]
pub struct PluginRegistry {
    deploy: HashMap<String, Arc<dyn DeployPlugin>>,
    post_process: Vec<Arc<dyn PostProcessPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_deploy(&mut self, plugin: Arc<dyn DeployPlugin>) {
        self.deploy.insert(plugin.code_type().to_string(), plugin);
    }

    pub fn register_post_process(&mut self, plugin: Arc<dyn PostProcessPlugin>) {
        self.post_process.push(plugin);
    }

    /// Unknown code type is an action failure, not a panic: the policy may
    /// reference executors this engine instance doesn't carry.
    pub fn deploy(&self, code_type: &str) -> Result<Arc<dyn DeployPlugin>> {
        self.deploy
            .get(code_type)
            .cloned()
            .ok_or_else(|| anyhow!("no deploy plugin registered for code type '{}'", code_type))
    }

    pub fn post_process(&self) -> &[Arc<dyn PostProcessPlugin>] {
        &self.post_process
    }
}
