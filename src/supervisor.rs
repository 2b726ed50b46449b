// =============================================================================
// Supervisor — boots every component in dependency order and owns shutdown
// =============================================================================
//
// Mirrors the reference implementation's top-level wiring (broker/store
// clients first, then the Rule Processor, then the Watcher Pool, then the
// Matcher and Dispatcher) but expressed as one process rather than five
// independently-deployed ones. `run` returns once a shutdown signal has been
// observed and every component has had a chance to drain.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::context::Context;
use crate::dispatcher::NotificationDispatcher;
use crate::matcher::RuleMatcher;
use crate::rules::processor::RuleProcessor;
use crate::watchers::pool::WatcherPool;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Supervisor {
    ctx: Arc<Context>,
}

impl Supervisor {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Start every component in dependency order, per §2: Rule Processor
    /// before the Watcher Pool (watchers need the live-watch index the
    /// processor maintains), Matcher before Dispatcher (send_notify has no
    /// producer until the matcher is listening).
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = self.ctx.shutdown_handle();

        info!("starting rule processor");
        let processor = Arc::new(RuleProcessor::new(self.ctx.clone()));
        processor.start(shutdown.clone()).await?;

        info!("starting rule matcher");
        let matcher = RuleMatcher::new(self.ctx.clone());
        matcher.start(shutdown.clone());

        info!("starting notification dispatcher");
        let dispatcher = NotificationDispatcher::new(self.ctx.clone());
        dispatcher.start(shutdown.clone());

        info!("starting watcher pool");
        let pool = WatcherPool::new(self.ctx.clone(), shutdown.clone());
        pool.start();

        info!("all components started, waiting for shutdown signal");
        Self::wait_for_shutdown_signal().await;

        info!("shutdown signal received — stopping components");
        self.ctx.trigger_shutdown();
        self.ctx.drain_shutdown(DRAIN_TIMEOUT).await;

        info!("supervisor shutdown complete");
        Ok(())
    }

    #[cfg(unix)]
    async fn wait_for_shutdown_signal() {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown_signal() {
        let _ = tokio::signal::ctrl_c().await;
    }
}
