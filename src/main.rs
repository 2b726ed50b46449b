// =============================================================================
// Market Monitor — entry point
// =============================================================================
//
// Boots the broker/store clients, builds the shared `Context`, and hands off
// to the `Supervisor` to start the rule processor, watcher pool, matcher,
// and dispatcher. This process is headless: rules arrive over the broker's
// `register_rule`/`deactivate_rule` topics from an external collaborator,
// never over an HTTP surface owned by this crate.
// =============================================================================

mod broker;
mod config;
mod context;
mod dispatcher;
mod external;
mod matcher;
mod models;
mod rules;
mod shutdown;
mod store;
mod supervisor;
mod watchers;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::context::Context;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("market monitor starting up");

    let config = config::init().unwrap_or_else(|e| {
        error!(error = %e, "failed to load config override, using environment defaults");
        Config::default()
    });

    let ctx = Context::build(config).await?;

    info!("context built, handing off to supervisor");
    Supervisor::new(ctx).run().await?;

    info!("market monitor shut down complete");
    Ok(())
}
