// =============================================================================
// EVM Wallet Tracker — Ethereum / BSC / Base, one instance per chain
// =============================================================================

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use tracing::{instrument, warn};

use crate::external::evm_rpc::{event_topic, EvmLog, EvmRpcClient};
use crate::models::{Chain, MatchEntry, TransferDirection, WalletSnapshot};
use crate::watchers::wallet_tracker::WalletTracker;

#[derive(Clone)]
struct TokenMeta {
    symbol: String,
    decimals: u8,
}

pub struct EvmWalletTracker {
    chain: Chain,
    client: EvmRpcClient,
    native_symbol: String,
    cold_start_blocks: u64,
    fanout_limit: usize,
    transfer_topic: String,
    erc1155_single_topic: String,
    erc1155_batch_topic: String,
    last_seen_block: RwLock<HashMap<String, u64>>,
    balance_cache: RwLock<HashMap<String, f64>>,
    tx_seen: RwLock<HashSet<String>>,
    token_meta: RwLock<HashMap<String, TokenMeta>>,
}

impl EvmWalletTracker {
    pub fn new(chain: Chain, client: EvmRpcClient, native_symbol: String, cold_start_blocks: u64, fanout_limit: usize) -> Self {
        Self {
            chain,
            client,
            native_symbol,
            cold_start_blocks,
            fanout_limit,
            transfer_topic: event_topic("Transfer(address,address,uint256)"),
            erc1155_single_topic: event_topic("TransferSingle(address,address,address,uint256,uint256)"),
            erc1155_batch_topic: event_topic("TransferBatch(address,address,address,uint256[],uint256[])"),
            last_seen_block: RwLock::new(HashMap::new()),
            balance_cache: RwLock::new(HashMap::new()),
            tx_seen: RwLock::new(HashSet::new()),
            token_meta: RwLock::new(HashMap::new()),
        }
    }

    async fn token_meta(&self, address: &str) -> TokenMeta {
        if let Some(meta) = self.token_meta.read().get(address).cloned() {
            return meta;
        }
        let decimals = self.client.token_decimals(address).await.unwrap_or(18);
        let symbol = self
            .client
            .token_symbol(address)
            .await
            .unwrap_or_else(|_| "UNKNOWN".to_string());
        let meta = TokenMeta { symbol, decimals };
        self.token_meta.write().insert(address.to_string(), meta.clone());
        meta
    }

    #[instrument(skip(self), fields(chain = %self.chain.as_str(), wallet))]
    async fn process_wallet(&self, wallet: &str, current_block: u64) -> anyhow::Result<WalletSnapshot> {
        let balance = self.client.get_balance(wallet).await?;
        let prev_balance = self.balance_cache.read().get(wallet).copied();
        let balance_change = prev_balance.map(|p| balance - p).unwrap_or(0.0);

        let from_block = {
            let mut last_seen = self.last_seen_block.write();
            let entry = last_seen
                .entry(wallet.to_string())
                .or_insert_with(|| current_block.saturating_sub(self.cold_start_blocks));
            let from_block = *entry;
            *entry = current_block;
            from_block
        };
        if current_block.saturating_sub(from_block) > self.cold_start_blocks {
            warn!(
                wallet,
                chain = %self.chain.as_str(),
                from_block,
                current_block,
                "watch gap exceeds the cold-start window — intervening transfers may have been missed"
            );
        }

        let wallet_lower = wallet.to_lowercase();
        let (transfer_logs, single_logs, batch_logs) = tokio::try_join!(
            self.client.get_logs(&self.transfer_topic, from_block, current_block),
            self.client.get_logs(&self.erc1155_single_topic, from_block, current_block),
            self.client.get_logs(&self.erc1155_batch_topic, from_block, current_block),
        )?;

        let mut by_tx: HashMap<String, Vec<EvmLog>> = HashMap::new();
        for log in transfer_logs.into_iter().chain(single_logs).chain(batch_logs) {
            if log_touches_wallet(&log, &wallet_lower) {
                by_tx.entry(log.transaction_hash.clone()).or_default().push(log);
            }
        }

        let mut transactions = Vec::new();
        for (tx_hash, logs) in by_tx {
            if !self.tx_seen.write().insert(tx_hash.clone()) {
                continue;
            }
            transactions.extend(self.classify_transaction(wallet, &wallet_lower, balance_change, &tx_hash, logs).await);
        }

        self.balance_cache.write().insert(wallet.to_string(), balance);

        Ok(WalletSnapshot {
            chain: self.chain,
            balance,
            balance_change,
            transactions,
            last_updated: Utc::now(),
        })
    }

    async fn classify_transaction(
        &self,
        wallet: &str,
        wallet_lower: &str,
        balance_change: f64,
        tx_hash: &str,
        logs: Vec<EvmLog>,
    ) -> Vec<MatchEntry> {
        let mut entries = Vec::new();
        let mut token_transfer: Option<(TransferDirection, String, f64)> = None;
        let mut nft_transfer: Option<(TransferDirection, String, String)> = None;

        for log in &logs {
            let topic0 = log.topics.first().cloned().unwrap_or_default();

            if topic0 == self.erc1155_single_topic || topic0 == self.erc1155_batch_topic {
                // operator is topics[1]; from/to are topics[2]/topics[3].
                let from = log.topics.get(2).map(|t| parse_address_from_topic(t)).unwrap_or_default();
                let to = log.topics.get(3).map(|t| parse_address_from_topic(t)).unwrap_or_default();
                let direction = if to == wallet_lower { TransferDirection::In } else { TransferDirection::Out };
                let (token_id, amount) = if topic0 == self.erc1155_single_topic {
                    (decode_erc1155_single_id(&log.data), decode_erc1155_single_amount(&log.data))
                } else {
                    // Batch transfers carry dynamic arrays of ids/amounts; this
                    // tracker reports the collection only for batch events
                    // rather than decoding the full array.
                    ("batch".to_string(), 1.0)
                };
                nft_transfer = Some((direction, log.address.clone(), token_id.clone()));
                entries.push(MatchEntry::NftTransfer {
                    direction,
                    wallet: wallet.to_string(),
                    chain: self.chain,
                    from,
                    to,
                    collection: log.address.clone(),
                    token_id,
                    amount,
                    tx_hash: tx_hash.to_string(),
                });
                continue;
            }

            // ERC-20/721 Transfer(from indexed, to indexed, value unindexed).
            let from = log.topics.get(1).map(|t| parse_address_from_topic(t)).unwrap_or_default();
            let to = log.topics.get(2).map(|t| parse_address_from_topic(t)).unwrap_or_default();
            let direction = if to == wallet_lower { TransferDirection::In } else { TransferDirection::Out };
            let value_raw = parse_u256_be_lossy(&log.data);
            let meta = self.token_meta(&log.address).await;

            if meta.decimals == 0 && value_raw == 1 {
                let token_id = value_raw.to_string();
                nft_transfer = Some((direction, log.address.clone(), token_id.clone()));
                entries.push(MatchEntry::NftTransfer {
                    direction,
                    wallet: wallet.to_string(),
                    chain: self.chain,
                    from,
                    to,
                    collection: log.address.clone(),
                    token_id,
                    amount: 1.0,
                    tx_hash: tx_hash.to_string(),
                });
            } else {
                let amount = value_raw as f64 / 10f64.powi(meta.decimals as i32);
                token_transfer = Some((direction, meta.symbol.clone(), amount));

                // A trade promotes this transfer to a single `token_trade`
                // match; otherwise the transfer stands alone.
                let trade = match (direction, balance_change) {
                    (TransferDirection::In, bc) if bc < 0.0 => Some(MatchEntry::TokenTrade {
                        wallet: wallet.to_string(),
                        chain: self.chain,
                        side: "buy".to_string(),
                        token_symbol: meta.symbol.clone(),
                        token_amount: amount,
                        counter_symbol: self.native_symbol.clone(),
                        counter_amount: bc.abs(),
                        dex: String::new(),
                        tx_hash: tx_hash.to_string(),
                    }),
                    (TransferDirection::Out, bc) if bc > 0.0 => Some(MatchEntry::TokenTrade {
                        wallet: wallet.to_string(),
                        chain: self.chain,
                        side: "sell".to_string(),
                        token_symbol: meta.symbol.clone(),
                        token_amount: amount,
                        counter_symbol: self.native_symbol.clone(),
                        counter_amount: bc,
                        dex: String::new(),
                        tx_hash: tx_hash.to_string(),
                    }),
                    _ => None,
                };

                entries.push(trade.unwrap_or_else(|| MatchEntry::TokenTransfer {
                    direction,
                    wallet: wallet.to_string(),
                    chain: self.chain,
                    from,
                    to,
                    amount,
                    token_symbol: meta.symbol.clone(),
                    contract_address: log.address.clone(),
                    tx_hash: tx_hash.to_string(),
                }));
            }
        }

        if let Some((nft_direction, collection, token_id)) = &nft_transfer {
            if let Some((token_direction, symbol, amount)) = &token_transfer {
                if token_direction != nft_direction {
                    entries.push(MatchEntry::NftTrade {
                        wallet: wallet.to_string(),
                        chain: self.chain,
                        direction: *nft_direction,
                        collection: collection.clone(),
                        token_id: token_id.clone(),
                        price_token: symbol.clone(),
                        price_amount: *amount,
                        tx_hash: tx_hash.to_string(),
                    });
                }
            } else {
                let opposite = match nft_direction {
                    TransferDirection::In => balance_change < 0.0,
                    TransferDirection::Out => balance_change > 0.0,
                };
                if opposite {
                    entries.push(MatchEntry::NftTrade {
                        wallet: wallet.to_string(),
                        chain: self.chain,
                        direction: *nft_direction,
                        collection: collection.clone(),
                        token_id: token_id.clone(),
                        price_token: self.native_symbol.clone(),
                        price_amount: balance_change.abs(),
                        tx_hash: tx_hash.to_string(),
                    });
                }
            }
        }

        entries
    }
}

fn log_touches_wallet(log: &EvmLog, wallet_lower: &str) -> bool {
    log.topics
        .iter()
        .skip(1)
        .any(|t| parse_address_from_topic(t) == wallet_lower)
}

/// A topic is a 32-byte word; an indexed `address` occupies its low 20 bytes.
fn parse_address_from_topic(topic: &str) -> String {
    let hex = topic.trim_start_matches("0x");
    if hex.len() < 40 {
        return String::new();
    }
    format!("0x{}", &hex[hex.len() - 40..]).to_lowercase()
}

/// Truncates to `u128` — sufficient for every realistic ERC-20 balance once
/// divided by `decimals`; no 256-bit integer type is pulled in for this.
fn parse_u256_be_lossy(data: &str) -> u128 {
    let hex = data.trim_start_matches("0x");
    if hex.len() < 32 {
        return 0;
    }
    u128::from_str_radix(&hex[hex.len() - 32..], 16).unwrap_or(0)
}

fn decode_erc1155_single_id(data: &str) -> String {
    let hex = data.trim_start_matches("0x");
    if hex.len() < 64 {
        return "0".to_string();
    }
    u128::from_str_radix(&hex[16..64], 16).map(|v| v.to_string()).unwrap_or_else(|_| "0".to_string())
}

/// `TransferSingle(operator, from, to, id, value)` carries `id` as the first
/// non-indexed word and `value` as the second.
fn decode_erc1155_single_amount(data: &str) -> f64 {
    let hex = data.trim_start_matches("0x");
    if hex.len() < 128 {
        return 1.0;
    }
    let word = &hex[64..128];
    u128::from_str_radix(&word[word.len() - 32..], 16).map(|v| v as f64).unwrap_or(1.0)
}

#[async_trait]
impl WalletTracker for EvmWalletTracker {
    #[instrument(skip(self, wallets), fields(chain = %self.chain.as_str()))]
    async fn get_wallet_data(&self, wallets: &[String]) -> anyhow::Result<HashMap<String, WalletSnapshot>> {
        let current_block = self.client.block_number().await?;

        let results: Vec<(String, anyhow::Result<WalletSnapshot>)> = stream::iter(wallets.iter())
            .map(|wallet| async move { (wallet.clone(), self.process_wallet(wallet, current_block).await) })
            .buffer_unordered(self.fanout_limit)
            .collect()
            .await;

        let mut out = HashMap::with_capacity(results.len());
        for (wallet, result) in results {
            match result {
                Ok(snapshot) => {
                    out.insert(wallet, snapshot);
                }
                Err(e) => warn!(wallet, chain = %self.chain.as_str(), error = %e, "failed to fetch wallet data — skipping this tick"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_from_padded_topic() {
        let topic = "0x000000000000000000000000aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(parse_address_from_topic(topic), "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn parses_u256_value_from_data() {
        let data = format!("0x{:064x}", 1_000_000u128);
        assert_eq!(parse_u256_be_lossy(&data), 1_000_000);
    }

    #[test]
    fn log_touches_wallet_checks_from_and_to_topics() {
        let log = EvmLog {
            address: "0xtoken".to_string(),
            topics: vec![
                "0xsig".to_string(),
                "0x000000000000000000000000bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
                "0x000000000000000000000000cccccccccccccccccccccccccccccccccccccccc".to_string(),
            ],
            data: "0x0".to_string(),
            transaction_hash: "0xtx".to_string(),
            block_number: 1,
        };
        assert!(log_touches_wallet(&log, "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"));
        assert!(!log_touches_wallet(&log, "0xdddddddddddddddddddddddddddddddddddddddd"));
    }
}
