//! Apply engine: executes the action list for one revision, component-level
//! actions on a worker pool, global actions after them, reporting every
//! outcome exactly once into the revision's result updater.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::{counter, histogram};
use tracing::debug;

use crate::action::{Action, ApplyResult, ApplyResultUpdater};
use crate::context::Context;

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

pub struct ApplyEngine {
    context: Context,
    actions: Vec<Action>,
    updater: Arc<dyn ApplyResultUpdater>,
    workers: usize,
}

impl ApplyEngine {
    pub fn new(context: Context, actions: Vec<Action>, updater: Arc<dyn ApplyResultUpdater>) -> Self {
        Self {
            context,
            actions,
            updater,
            workers: default_workers(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Runs the whole cycle. Actions for the same component instance form a
    /// chain executed in order; a failure in a chain skips its remaining
    /// actions but never affects other chains. Global actions (post-process)
    /// run after all component chains, sequentially.
    pub fn apply(self) -> ApplyResult {
        let started = std::time::Instant::now();
        let ApplyEngine {
            context,
            actions,
            updater,
            workers,
        } = self;

        updater.set_total(actions.len() as u32);

        let mut chains: Vec<Vec<Action>> = Vec::new();
        let mut chain_index: HashMap<String, usize> = HashMap::new();
        let mut global: Vec<Action> = Vec::new();
        for action in actions {
            match action.component_key() {
                Some(key) => {
                    let idx = *chain_index.entry(key.to_string()).or_insert_with(|| {
                        chains.push(Vec::new());
                        chains.len() - 1
                    });
                    chains[idx].push(action);
                }
                None => global.push(action),
            }
        }

        let next = AtomicUsize::new(0);
        let worker_count = workers.min(chains.len().max(1));
        let next = &next;
        let chains = &chains;
        let ctx = &context;
        let upd = &updater;
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(move || loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= chains.len() {
                        break;
                    }
                    run_chain(&chains[i], ctx, upd.as_ref());
                });
            }
        });

        for action in &global {
            run_one(action, ctx, upd.as_ref());
        }

        updater.append_log(context.event_log.drain());
        let result = updater.done();
        histogram!("apply_cycle_ms", started.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

fn run_chain(chain: &[Action], ctx: &Context, updater: &dyn ApplyResultUpdater) {
    for (idx, action) in chain.iter().enumerate() {
        if !run_one(action, ctx, updater) {
            // Remaining actions for this component instance are skipped:
            // they assume the failed step took effect.
            for skipped in &chain[idx + 1..] {
                debug!(action = %skipped, "skipping action after earlier failure in chain");
                updater.add_skipped();
                counter!("apply_action_skipped_total", 1u64);
            }
            return;
        }
    }
}

fn run_one(action: &Action, ctx: &Context, updater: &dyn ApplyResultUpdater) -> bool {
    counter!("apply_action_total", 1u64);
    match action.apply(ctx) {
        Ok(()) => {
            updater.add_success();
            true
        }
        Err(err) => {
            ctx.event_log
                .error(format!("error while applying action '{}': {:#}", action, err));
            updater.add_failed();
            counter!("apply_action_failed_total", 1u64);
            false
        }
    }
}
