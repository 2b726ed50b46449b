// =============================================================================
// Wallet Watcher — fans a watching set of addresses out across four chains
// =============================================================================
//
// Wallet classification (EVM vs. Solana) is memoized per address, mirroring
// the reference implementation's `WalletTrackerFactory.get_wallet_type`
// cache. Every configured EVM chain is queried for every EVM wallet — a
// wallet isn't tied to one chain, so the watcher can't know in advance which
// chain(s) it's active on.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use crate::context::Context;
use crate::external::evm_rpc::EvmRpcClient;
use crate::models::{topics, Chain, MatchData, Rule, RuleMatch, WatchType};
use crate::watchers::base::{Watcher, WatcherRuntime};
use crate::watchers::wallet_tracker::{EvmWalletTracker, SolanaWalletTracker, WalletTracker};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// `0x` + 40 hex chars.
fn looks_like_evm_address(address: &str) -> bool {
    address.len() == 42 && address.starts_with("0x") && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Solana addresses are base58-encoded 32-byte public keys, which renders to
/// 32-44 base58 characters depending on leading-zero bytes. No `bs58` crate
/// is pulled in for a full decode-and-check-length-32 — this is a cheap
/// shape check, good enough to route a wallet to the right tracker.
fn looks_like_solana_address(address: &str) -> bool {
    (32..=44).contains(&address.len()) && address.chars().all(|c| BASE58_ALPHABET.contains(c))
}

pub struct WalletWatcher {
    pub runtime: Arc<WatcherRuntime>,
    evm_trackers: HashMap<String, EvmWalletTracker>,
    solana_tracker: SolanaWalletTracker,
    /// Memoized EVM/Solana classification, keyed by address — `true` = EVM.
    wallet_kind_cache: RwLock<HashMap<String, bool>>,
}

impl WalletWatcher {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let mut evm_trackers = HashMap::new();
        for chain in Chain::evm_chains() {
            let chain_name = chain.as_str();
            if let Some(client) = ctx.evm_client(chain_name) {
                evm_trackers.insert(
                    chain_name.to_string(),
                    EvmWalletTracker::new(
                        chain,
                        client.clone(),
                        ctx.config.native_symbol(chain_name).to_string(),
                        ctx.config.watch.cold_start_blocks,
                        ctx.config.watch.wallet_fanout_limit,
                    ),
                );
            }
        }
        let solana_tracker = SolanaWalletTracker::new(ctx.solana_client.clone(), ctx.config.watch.wallet_fanout_limit);

        Arc::new(Self {
            runtime: Arc::new(WatcherRuntime::new(ctx, WatchType::Wallet)),
            evm_trackers,
            solana_tracker,
            wallet_kind_cache: RwLock::new(HashMap::new()),
        })
    }

    fn wallet_kind(&self, address: &str) -> Option<bool> {
        if let Some(&is_evm) = self.wallet_kind_cache.read().get(address) {
            return Some(is_evm);
        }
        let kind = if looks_like_evm_address(address) {
            Some(true)
        } else if looks_like_solana_address(address) {
            Some(false)
        } else {
            None
        };
        if let Some(is_evm) = kind {
            self.wallet_kind_cache.write().insert(address.to_string(), is_evm);
        }
        kind
    }

    async fn warm_wallet(&self, wallet: &str) {
        let single = vec![wallet.to_string()];
        match self.wallet_kind(wallet) {
            Some(true) => {
                for (chain_name, tracker) in &self.evm_trackers {
                    if let Err(e) = tracker.get_wallet_data(&single).await {
                        warn!(wallet, chain = %chain_name, error = %e, "failed to warm evm wallet cache");
                    }
                }
            }
            Some(false) => {
                if let Err(e) = self.solana_tracker.get_wallet_data(&single).await {
                    warn!(wallet, error = %e, "failed to warm solana wallet cache");
                }
            }
            None => warn!(wallet, "invalid wallet address — skipping cache warm"),
        }
    }
}

#[async_trait]
impl Watcher for WalletWatcher {
    fn watch_type(&self) -> WatchType {
        WatchType::Wallet
    }

    fn runtime(&self) -> &Arc<WatcherRuntime> {
        &self.runtime
    }

    fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.ctx.config.watch.wallet_interval_secs)
    }

    async fn initialize_cache(&self, targets: &[String]) {
        for target in targets {
            self.warm_wallet(target).await;
        }
    }

    #[instrument(skip(self, targets))]
    async fn watch_targets(&self, targets: &[String]) -> anyhow::Result<()> {
        let mut rules: HashMap<String, Rule> = HashMap::new();
        for target in targets {
            for rule in self.runtime.rules_for_target(target).await {
                rules.insert(rule.rule_id.clone(), rule);
            }
        }
        if rules.is_empty() {
            return Ok(());
        }

        let mut evm_wallets = Vec::new();
        let mut solana_wallets = Vec::new();
        for target in targets {
            match self.wallet_kind(target) {
                Some(true) => evm_wallets.push(target.clone()),
                Some(false) => solana_wallets.push(target.clone()),
                None => warn!(wallet = %target, "invalid wallet address — skipping this tick"),
            }
        }

        // wallet -> every chain snapshot it showed activity on this tick.
        let mut snapshots: HashMap<String, Vec<crate::models::WalletSnapshot>> = HashMap::new();

        if !evm_wallets.is_empty() {
            for (chain_name, tracker) in &self.evm_trackers {
                match tracker.get_wallet_data(&evm_wallets).await {
                    Ok(data) => {
                        for (wallet, snapshot) in data {
                            snapshots.entry(wallet).or_default().push(snapshot);
                        }
                    }
                    Err(e) => warn!(chain = %chain_name, error = %e, "evm wallet fetch failed this tick"),
                }
            }
        }
        if !solana_wallets.is_empty() {
            match self.solana_tracker.get_wallet_data(&solana_wallets).await {
                Ok(data) => {
                    for (wallet, snapshot) in data {
                        snapshots.entry(wallet).or_default().push(snapshot);
                    }
                }
                Err(e) => warn!(error = %e, "solana wallet fetch failed this tick"),
            }
        }

        if snapshots.is_empty() {
            return Ok(());
        }

        for rule in rules.values() {
            let mut entries = Vec::new();
            for target in &rule.target {
                if !targets.contains(target) {
                    continue;
                }
                if let Some(snaps) = snapshots.get(target) {
                    for snapshot in snaps {
                        entries.extend(snapshot.transactions.clone());
                    }
                }
            }

            if !entries.is_empty() {
                let rule_match = RuleMatch {
                    rule: rule.clone(),
                    match_data: MatchData { matches: entries },
                    matched_at: Utc::now(),
                };
                let topic = topics::rule_matched(WatchType::Wallet);
                if let Err(e) = self.runtime.ctx.broker.publish(&topic, &rule_match).await {
                    warn!(rule_id = %rule.rule_id, error = %e, "failed to publish rule_matched");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_evm_address_shape() {
        assert!(looks_like_evm_address("0x1234567890abcdef1234567890abcdef12345678"));
        assert!(!looks_like_evm_address("0x123"));
        assert!(!looks_like_evm_address("not-an-address"));
    }

    #[test]
    fn recognises_solana_address_shape() {
        assert!(looks_like_solana_address("5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1"));
        assert!(!looks_like_solana_address("0x1234567890abcdef1234567890abcdef12345678"));
        assert!(!looks_like_solana_address("too-short"));
    }
}
