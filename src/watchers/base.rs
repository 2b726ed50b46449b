// =============================================================================
// Watcher base — shared watch-loop/subscription-maintenance runtime
// =============================================================================
//
// The Rust analogue of the reference implementation's `BaseWatcher`: owns the
// in-memory watching set, spawns the watch loop and the
// register/deactivate-rule subscriptions, and implements the generic
// registration/deactivation handling so each concrete watcher only supplies
// `watch_targets` and (optionally) `initialize_cache`.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::context::Context;
use crate::models::{topics, Rule, WatchType};
use crate::shutdown::Shutdown;

/// Implemented by `TokenWatcher`, `WalletWatcher`, `AirdropWatcher`.
#[async_trait]
pub trait Watcher: Send + Sync {
    fn watch_type(&self) -> WatchType;
    fn watch_interval(&self) -> Duration;

    /// Shared runtime embedded by the concrete watcher — lets the pool
    /// health loop inspect `is_running`/`target_count` without knowing the
    /// concrete type.
    fn runtime(&self) -> &Arc<WatcherRuntime>;

    /// Fetch fresh data for every currently-watched target, evaluate every
    /// rule registered against it, and publish `rule_matched` for each hit.
    async fn watch_targets(&self, targets: &[String]) -> anyhow::Result<()>;

    /// One-shot hook invoked when a target is newly registered — lets a
    /// watcher warm its caches (e.g. the wallet watcher priming balance/tx
    /// state) instead of diffing against an empty baseline on the first
    /// tick.
    async fn initialize_cache(&self, _targets: &[String]) {}
}

/// Shared state + loops for one watcher. A concrete watcher embeds a
/// `WatcherRuntime` and delegates `is_running`/`target_count` to it.
pub struct WatcherRuntime {
    pub ctx: Arc<Context>,
    watch_type: WatchType,
    watching: RwLock<HashSet<String>>,
    running: AtomicBool,
    /// Set by `start()` so `handle_rule_registration` can warm newly-added
    /// targets through the concrete watcher's `initialize_cache` hook.
    watcher: RwLock<Option<std::sync::Weak<dyn Watcher>>>,
}

impl WatcherRuntime {
    pub fn new(ctx: Arc<Context>, watch_type: WatchType) -> Self {
        Self {
            ctx,
            watch_type,
            watching: RwLock::new(HashSet::new()),
            running: AtomicBool::new(false),
            watcher: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn target_count(&self) -> usize {
        self.watching.read().len()
    }

    pub fn targets(&self) -> Vec<String> {
        self.watching.read().iter().cloned().collect()
    }

    /// Spawn the watch loop and the subscription maintainer for this
    /// watcher's register/deactivate topics. `watcher` is the concrete
    /// implementation (kept as a separate `Arc` rather than `self` so the
    /// runtime doesn't need a self-referential trait object).
    pub fn start(self: Arc<Self>, watcher: Arc<dyn Watcher>, shutdown: Shutdown) {
        self.running.store(true, Ordering::Relaxed);
        *self.watcher.write() = Some(Arc::downgrade(&watcher));
        self.spawn_watch_loop(watcher, shutdown.clone());
        self.spawn_registration_subscription(shutdown.clone());
        self.spawn_deactivation_subscription(shutdown);
    }

    fn spawn_watch_loop(self: &Arc<Self>, watcher: Arc<dyn Watcher>, mut shutdown: Shutdown) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.watch_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.signalled() => {
                        info!(watch_type = %runtime.watch_type, "watch loop shutting down");
                        runtime.running.store(false, Ordering::Relaxed);
                        return;
                    }
                    _ = interval.tick() => {
                        let targets = runtime.targets();
                        if targets.is_empty() {
                            continue;
                        }
                        if let Err(e) = watcher.watch_targets(&targets).await {
                            error!(watch_type = %runtime.watch_type, error = %e, "watch tick failed — will retry next interval");
                        }
                    }
                }
            }
        });
    }

    fn spawn_registration_subscription(self: &Arc<Self>, shutdown: Shutdown) {
        let runtime = self.clone();
        let topic = topics::register_rule(self.watch_type);
        self.ctx.broker.subscribe(
            topic,
            Arc::new(move |_channel, payload| {
                let runtime = runtime.clone();
                Box::pin(async move {
                    match serde_json::from_value::<Rule>(payload) {
                        Ok(rule) => runtime.handle_rule_registration(rule).await,
                        Err(e) => warn!(error = %e, "dropping undecodable register_rule payload"),
                    }
                })
            }),
            shutdown,
        );
    }

    fn spawn_deactivation_subscription(self: &Arc<Self>, shutdown: Shutdown) {
        let runtime = self.clone();
        let topic = topics::deactivate_rule(self.watch_type);
        self.ctx.broker.subscribe(
            topic,
            Arc::new(move |_channel, payload| {
                let runtime = runtime.clone();
                Box::pin(async move {
                    runtime.handle_rule_deactivation(payload).await;
                })
            }),
            shutdown,
        );
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id, watch_type = %self.watch_type))]
    async fn handle_rule_registration(&self, rule: Rule) {
        if rule.watch_type != self.watch_type {
            return;
        }

        let mut new_targets = Vec::new();
        {
            let mut watching = self.watching.write();
            for target in &rule.target {
                if watching.insert(target.clone()) {
                    new_targets.push(target.clone());
                }
            }
        }

        let rule_json = match serde_json::to_string(&rule) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize rule for watch entry");
                return;
            }
        };
        for target in &rule.target {
            let key = topics::active_watch_key(self.watch_type, target);
            if let Err(e) = self.ctx.broker.hset(&key, &rule.rule_id, &rule_json).await {
                warn!(target, error = %e, "failed to persist watch entry");
            }
        }

        if !new_targets.is_empty() {
            let watcher = self.watcher.read().as_ref().and_then(std::sync::Weak::upgrade);
            if let Some(watcher) = watcher {
                watcher.initialize_cache(&new_targets).await;
            }
        }

        debug!(new_targets = new_targets.len(), "watching set updated");
    }

    #[instrument(skip(self, payload), fields(watch_type = %self.watch_type))]
    async fn handle_rule_deactivation(&self, payload: serde_json::Value) {
        let rule_id = match payload.get("rule_id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                warn!("deactivate_rule payload missing rule_id");
                return;
            }
        };

        let targets: Vec<String> = match payload.get("target") {
            Some(serde_json::Value::Array(arr)) => {
                arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()
            }
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => self.targets(),
        };

        for target in targets {
            let key = topics::active_watch_key(self.watch_type, &target);
            if let Err(e) = self.ctx.broker.hdel(&key, &rule_id).await {
                warn!(target, error = %e, "failed to remove watch entry");
                continue;
            }
            match self.ctx.broker.hlen(&key).await {
                Ok(0) => {
                    self.watching.write().remove(&target);
                    debug!(target, "target left watching set — no rules remain");
                }
                Ok(_) => {}
                Err(e) => warn!(target, error = %e, "failed to check remaining watch entries"),
            }
        }
    }

    /// All rules currently registered for `target`, decoded from the broker
    /// hash. Malformed entries are logged and skipped rather than aborting
    /// the whole tick.
    pub async fn rules_for_target(&self, target: &str) -> Vec<Rule> {
        let key = topics::active_watch_key(self.watch_type, target);
        match self.ctx.broker.hgetall(&key).await {
            Ok(entries) => entries
                .into_values()
                .filter_map(|raw| match serde_json::from_str::<Rule>(&raw) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        warn!(target, error = %e, "skipping malformed watch entry");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(target, error = %e, "failed to load rules for target");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_runtime_starts_with_empty_watching_set() {
        // WatcherRuntime construction doesn't need a live Context for this
        // check, but `Context` isn't trivially constructible without live
        // clients, so this exercises only the pure parts through a
        // lighter-weight helper in the concrete watcher test modules.
        let watching: RwLock<HashSet<String>> = RwLock::new(HashSet::new());
        assert_eq!(watching.read().len(), 0);
    }
}
