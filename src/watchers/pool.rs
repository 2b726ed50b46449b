// =============================================================================
// Watcher Pool — owns the three watchers and their health-check loop
// =============================================================================
//
// The Rust analogue of the reference implementation's `WorkerPool`: starts
// the token/wallet/airdrop watchers, polls `is_running` every 30s, restarts
// any watcher whose watch loop has died, and publishes the aggregated
// status to `worker:status` with a 60s TTL.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::shutdown::Shutdown;
use crate::watchers::airdrop::AirdropWatcher;
use crate::watchers::base::Watcher;
use crate::watchers::token::TokenWatcher;
use crate::watchers::wallet::WalletWatcher;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const WORKER_STATUS_TTL_SECS: u64 = 60;
const WORKER_STATUS_KEY: &str = "worker:status";

type Constructor = fn(Arc<Context>) -> Arc<dyn Watcher>;

fn constructors() -> [(&'static str, Constructor); 3] {
    [
        ("token", |ctx| TokenWatcher::new(ctx) as Arc<dyn Watcher>),
        ("wallet", |ctx| WalletWatcher::new(ctx) as Arc<dyn Watcher>),
        ("airdrop", |ctx| AirdropWatcher::new(ctx) as Arc<dyn Watcher>),
    ]
}

#[derive(Serialize)]
struct WorkerStatus {
    active: bool,
    targets: usize,
    last_check: chrono::DateTime<Utc>,
}

pub struct WatcherPool {
    ctx: Arc<Context>,
    shutdown: Shutdown,
    workers: RwLock<HashMap<String, (Constructor, Arc<dyn Watcher>)>>,
}

impl WatcherPool {
    pub fn new(ctx: Arc<Context>, shutdown: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            shutdown,
            workers: RwLock::new(HashMap::new()),
        })
    }

    /// Start all three watchers and the health-check loop.
    pub fn start(self: &Arc<Self>) {
        for (id, ctor) in constructors() {
            self.add_worker(id, ctor);
        }
        for (id, (_, watcher)) in self.workers.read().iter() {
            info!(worker = id, running = watcher.runtime().is_running(), "watcher pool member started");
        }
        self.clone().spawn_health_loop();
    }

    fn add_worker(&self, id: &str, ctor: Constructor) {
        let watcher = ctor(self.ctx.clone());
        watcher.runtime().clone().start(watcher.clone(), self.shutdown.clone());
        self.workers.write().insert(id.to_string(), (ctor, watcher));
    }

    fn spawn_health_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.signalled() => {
                        info!("watcher pool health loop shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        self.run_health_check().await;
                    }
                }
            }
        });
    }

    async fn run_health_check(&self) {
        let now = Utc::now();
        let mut restarts = Vec::new();
        let mut status = HashMap::new();

        for (id, (ctor, watcher)) in self.workers.read().iter() {
            let runtime = watcher.runtime();
            if !runtime.is_running() {
                warn!(worker = id, "watcher is not running, scheduling restart");
                restarts.push((id.clone(), *ctor));
            }
            status.insert(
                id.clone(),
                WorkerStatus {
                    active: runtime.is_running(),
                    targets: runtime.target_count(),
                    last_check: now,
                },
            );
        }

        for (id, ctor) in restarts {
            self.add_worker(&id, ctor);
            if let Some((_, watcher)) = self.workers.read().get(&id) {
                status.insert(
                    id,
                    WorkerStatus {
                        active: watcher.runtime().is_running(),
                        targets: watcher.runtime().target_count(),
                        last_check: now,
                    },
                );
            }
        }

        match serde_json::to_string(&status) {
            Ok(body) => {
                if let Err(e) = self.ctx.broker.set(WORKER_STATUS_KEY, &body, Some(WORKER_STATUS_TTL_SECS)).await {
                    error!(error = %e, "failed to publish worker status");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize worker status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_cover_all_watch_types() {
        let ids: Vec<&str> = constructors().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["token", "wallet", "airdrop"]);
    }
}
