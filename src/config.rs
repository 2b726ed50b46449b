// =============================================================================
// Config — process configuration loaded once at startup
// =============================================================================
//
// Every connection string, API endpoint, and tunable interval lives here so
// that a single `Config` is built in `main` and threaded through every
// component via `Context`. Values come from environment variables (with an
// optional `.env` file loaded by `dotenv` in development); a JSON override
// file may additionally be supplied for the notification/blockchain sections,
// which are awkward to express as flat env vars.
//
// All fields carry `#[serde(default = "..")]` so that a partial override
// file never fails to deserialise.
// =============================================================================

use std::collections::HashMap;
use std::env;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

fn default_mongo_url() -> String {
    env::var("MONGO_URI").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string())
}

fn default_mongo_db() -> String {
    env::var("MONGO_DB").unwrap_or_else(|_| "market_monitor".to_string())
}

fn default_coingecko_url() -> String {
    env::var("COINGECKO_API_URL").unwrap_or_else(|_| "https://api.coingecko.com/api/v3".to_string())
}

fn default_alert_url() -> String {
    env::var("ALERT_API_URL").unwrap_or_else(|_| "http://localhost:5000/alert".to_string())
}

fn default_airdrop_alert_url() -> String {
    env::var("AIRDROP_ALERT_API_URL").unwrap_or_else(|_| "http://localhost:5000/airdrop".to_string())
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_token_watch_interval_secs() -> u64 {
    30
}

fn default_wallet_watch_interval_secs() -> u64 {
    5
}

fn default_airdrop_watch_interval_secs() -> u64 {
    900
}

fn default_cold_start_blocks() -> u64 {
    100
}

fn default_wallet_fanout_limit() -> usize {
    10
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_matcher_dedup_window_secs() -> i64 {
    60
}

fn default_dispatcher_dedup_window_secs() -> i64 {
    300
}

fn default_dispatcher_dedup_max_messages() -> isize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_retry_max_delay_secs() -> u64 {
    10
}

fn default_dispatcher_retry_delay_secs() -> u64 {
    5
}

fn default_rate_limit_quotas() -> HashMap<String, u32> {
    let mut m = HashMap::new();
    m.insert("telegram".to_string(), 30);
    m.insert("web".to_string(), 100);
    m.insert("discord".to_string(), 50);
    m
}

fn default_evm_chains() -> HashMap<String, ChainConfig> {
    let mut m = HashMap::new();
    m.insert(
        "ethereum".to_string(),
        ChainConfig {
            rpc_url: env::var("ETH_RPC_URL")
                .unwrap_or_else(|_| "https://eth-mainnet.g.alchemy.com/v2/demo".to_string()),
            chain_id: 1,
            native_symbol: "ETH".to_string(),
            scan_url: "https://etherscan.io".to_string(),
        },
    );
    m.insert(
        "bsc".to_string(),
        ChainConfig {
            rpc_url: env::var("BSC_RPC_URL")
                .unwrap_or_else(|_| "https://bsc-dataseed.binance.org/".to_string()),
            chain_id: 56,
            native_symbol: "BNB".to_string(),
            scan_url: "https://bscscan.com".to_string(),
        },
    );
    m.insert(
        "base".to_string(),
        ChainConfig {
            rpc_url: env::var("BASE_RPC_URL").unwrap_or_else(|_| "https://mainnet.base.org".to_string()),
            chain_id: 8453,
            native_symbol: "ETH".to_string(),
            scan_url: "https://basescan.org".to_string(),
        },
    );
    m
}

fn default_solana_rpc_url() -> String {
    env::var("SOL_RPC_URL").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string())
}

// =============================================================================
// Sub-sections
// =============================================================================

/// Per-chain EVM connection details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub native_symbol: String,
    pub scan_url: String,
}

/// Watch-loop intervals, one per watch type, plus shared tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_token_watch_interval_secs")]
    pub token_interval_secs: u64,

    #[serde(default = "default_wallet_watch_interval_secs")]
    pub wallet_interval_secs: u64,

    #[serde(default = "default_airdrop_watch_interval_secs")]
    pub airdrop_interval_secs: u64,

    /// Cold-start lookback window, in blocks, for a wallet with no cached
    /// `last_seen_block`.
    #[serde(default = "default_cold_start_blocks")]
    pub cold_start_blocks: u64,

    /// Bounded parallelism for per-chain wallet fetches.
    #[serde(default = "default_wallet_fanout_limit")]
    pub wallet_fanout_limit: usize,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            token_interval_secs: default_token_watch_interval_secs(),
            wallet_interval_secs: default_wallet_watch_interval_secs(),
            airdrop_interval_secs: default_airdrop_watch_interval_secs(),
            cold_start_blocks: default_cold_start_blocks(),
            wallet_fanout_limit: default_wallet_fanout_limit(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

/// Matcher and dispatcher dedup/rate-limit/retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_matcher_dedup_window_secs")]
    pub matcher_dedup_window_secs: i64,

    #[serde(default = "default_dispatcher_dedup_window_secs")]
    pub dispatcher_dedup_window_secs: i64,

    #[serde(default = "default_dispatcher_dedup_max_messages")]
    pub dispatcher_dedup_max_messages: isize,

    #[serde(default = "default_rate_limit_quotas")]
    pub rate_limit_quotas_per_minute: HashMap<String, u32>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Flat (non-exponential) delay between send attempts in the
    /// dispatcher's retry loop — distinct from the RPC clients'
    /// exponential `RetryPolicy`.
    #[serde(default = "default_dispatcher_retry_delay_secs")]
    pub dispatcher_retry_delay_secs: u64,

    #[serde(default)]
    pub telegram_bot_token: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            matcher_dedup_window_secs: default_matcher_dedup_window_secs(),
            dispatcher_dedup_window_secs: default_dispatcher_dedup_window_secs(),
            dispatcher_dedup_max_messages: default_dispatcher_dedup_max_messages(),
            rate_limit_quotas_per_minute: default_rate_limit_quotas(),
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            dispatcher_retry_delay_secs: default_dispatcher_retry_delay_secs(),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level process configuration.
///
/// Every field has a serde default so that a partial override file never
/// fails to deserialise; unset fields fall back to the environment-variable
/// derived defaults above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_mongo_url")]
    pub mongo_url: String,

    #[serde(default = "default_mongo_db")]
    pub mongo_db: String,

    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,

    #[serde(default)]
    pub coingecko_api_key: Option<String>,

    #[serde(default = "default_alert_url")]
    pub alert_api_url: String,

    #[serde(default = "default_airdrop_alert_url")]
    pub airdrop_alert_api_url: String,

    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,

    #[serde(default = "default_http_timeout_secs")]
    pub http_connect_timeout_secs: u64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_read_timeout_secs: u64,

    #[serde(default = "default_evm_chains")]
    pub evm_chains: HashMap<String, ChainConfig>,

    #[serde(default = "default_solana_rpc_url")]
    pub solana_rpc_url: String,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub notification: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            mongo_url: default_mongo_url(),
            mongo_db: default_mongo_db(),
            coingecko_url: default_coingecko_url(),
            coingecko_api_key: env::var("COINGECKO_API_KEY").ok(),
            alert_api_url: default_alert_url(),
            airdrop_alert_api_url: default_airdrop_alert_url(),
            telegram_api_base: default_telegram_api_base(),
            http_connect_timeout_secs: default_http_timeout_secs(),
            http_read_timeout_secs: default_http_timeout_secs(),
            evm_chains: default_evm_chains(),
            solana_rpc_url: default_solana_rpc_url(),
            watch: WatchConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Config {
    /// Build the process configuration: start from environment-derived
    /// defaults, then overlay a JSON file at `path` if one exists.
    ///
    /// Unlike a hot-reloadable engine config, this is read once at startup;
    /// there is no `save` — operators edit the file or the environment and
    /// restart the process.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "no config override file found, using environment defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config override from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config override from {}", path.display()))?;

        info!(
            path = %path.display(),
            redis_url = %config.redis_url,
            mongo_db = %config.mongo_db,
            "config loaded"
        );

        Ok(config)
    }

    /// Get the RPC URL for a chain by lowercase name, e.g. `"ethereum"`.
    pub fn evm_rpc_url(&self, chain: &str) -> Option<&str> {
        self.evm_chains.get(chain).map(|c| c.rpc_url.as_str())
    }

    /// Get the block-explorer base URL for a chain, `"solana"` included.
    pub fn scan_url(&self, chain: &str) -> &str {
        if chain.eq_ignore_ascii_case("solana") {
            return "https://solscan.io";
        }
        self.evm_chains
            .get(chain)
            .map(|c| c.scan_url.as_str())
            .unwrap_or("https://etherscan.io")
    }

    /// Get the native asset symbol for a chain.
    pub fn native_symbol(&self, chain: &str) -> &str {
        if chain.eq_ignore_ascii_case("solana") {
            return "SOL";
        }
        self.evm_chains
            .get(chain)
            .map(|c| c.native_symbol.as_str())
            .unwrap_or("ETH")
    }

    /// Rate-limit quota (messages per minute) for a notification channel.
    pub fn rate_limit_quota(&self, channel: &str) -> u32 {
        self.notification
            .rate_limit_quotas_per_minute
            .get(channel)
            .copied()
            .unwrap_or(30)
    }
}

/// Load a local `.env` file if present, then build `Config`.
///
/// Missing `.env` is not an error — production deployments set real
/// environment variables directly.
pub fn init() -> Result<Config> {
    if dotenv::dotenv().is_err() {
        warn!("no .env file found, relying on process environment");
    }

    let override_path = env::var("MARKET_MONITOR_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    Config::load(override_path)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.mongo_db, "market_monitor");
        assert_eq!(cfg.watch.token_interval_secs, 30);
        assert_eq!(cfg.watch.wallet_interval_secs, 5);
        assert_eq!(cfg.watch.airdrop_interval_secs, 900);
        assert_eq!(cfg.watch.cold_start_blocks, 100);
        assert_eq!(cfg.notification.matcher_dedup_window_secs, 60);
        assert_eq!(cfg.notification.dispatcher_dedup_window_secs, 300);
        assert_eq!(cfg.notification.max_retries, 3);
        assert_eq!(cfg.rate_limit_quota("telegram"), 30);
        assert_eq!(cfg.rate_limit_quota("web"), 100);
        assert_eq!(cfg.rate_limit_quota("discord"), 50);
        assert_eq!(cfg.rate_limit_quota("unknown"), 30);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.watch.token_interval_secs, 30);
        assert_eq!(cfg.notification.max_retries, 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mongo_db": "custom_db", "watch": { "token_interval_secs": 15 } }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mongo_db, "custom_db");
        assert_eq!(cfg.watch.token_interval_secs, 15);
        assert_eq!(cfg.watch.wallet_interval_secs, 5);
        assert_eq!(cfg.notification.max_retries, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mongo_db, cfg2.mongo_db);
        assert_eq!(cfg.watch.token_interval_secs, cfg2.watch.token_interval_secs);
    }

    #[test]
    fn load_missing_override_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/path/config.json").unwrap();
        assert_eq!(cfg.mongo_db, "market_monitor");
    }
}
