// =============================================================================
// Context — central application state, built once in `main` and threaded
// through every component
// =============================================================================
//
// Replaces the reference implementation's ambient module-level singletons
// (`MongoClient.get_instance()`, `Chain.w3`, `get_config()`) with explicit
// injection, per §9's Design Notes. Every component constructor takes an
// `Arc<Context>` (or the individual `Arc` fields it needs) instead of
// reaching for a global.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::external::{AlertsClient, EvmRpcClient, PriceClient, SolanaRpcClient};
use crate::shutdown::{Shutdown, ShutdownController};
use crate::store::RuleStore;

pub struct Context {
    pub config: Arc<Config>,
    pub broker: BrokerClient,
    pub store: RuleStore,
    pub price_client: PriceClient,
    pub alerts_client: AlertsClient,
    pub evm_clients: HashMap<String, EvmRpcClient>,
    pub solana_client: SolanaRpcClient,
    pub http: reqwest::Client,
    shutdown: ShutdownController,
}

impl Context {
    /// Build every client eagerly so that a misconfigured deployment fails
    /// fast at startup rather than on the first watch tick.
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        info!("connecting to broker and store");
        let broker = BrokerClient::connect(&config.redis_url).await?;
        let store = RuleStore::connect(&config.mongo_url, &config.mongo_db).await?;

        let price_client = PriceClient::new(config.coingecko_url.clone(), config.coingecko_api_key.clone());
        let alerts_client = AlertsClient::new(config.alert_api_url.clone(), config.airdrop_alert_api_url.clone());

        let mut evm_clients = HashMap::new();
        for (chain, chain_config) in &config.evm_chains {
            evm_clients.insert(chain.clone(), EvmRpcClient::new(chain_config.rpc_url.clone()));
        }
        let solana_client = SolanaRpcClient::new(config.solana_rpc_url.clone());

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(5))
            .pool_max_idle_per_host(100)
            .build()?;

        info!("context built — all external clients initialised");

        Ok(Arc::new(Self {
            config,
            broker,
            store,
            price_client,
            alerts_client,
            evm_clients,
            solana_client,
            http,
            shutdown: ShutdownController::new(),
        }))
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.handle()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub async fn drain_shutdown(&self, timeout: std::time::Duration) {
        self.shutdown.drain(timeout).await;
    }

    pub fn evm_client(&self, chain: &str) -> Option<&EvmRpcClient> {
        self.evm_clients.get(chain)
    }
}
