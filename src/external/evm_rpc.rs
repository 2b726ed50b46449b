// =============================================================================
// EVM RPC Client — thin JSON-RPC wrapper used by the EVM wallet tracker
// =============================================================================
//
// One client per chain (Ethereum, BSC, Base), long-lived for the process
// per §5's "per-chain JSON-RPC clients are long-lived singletons". No ABI
// encoding library is pulled in — the handful of calls needed (balance,
// logs, and the three read-only ERC-20 accessor functions) are hand-encoded
// since the full selector/arg encoding surface is a single four-byte
// selector with no arguments for each of `name()`/`symbol()`/`decimals()`.
// =============================================================================

use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{instrument, warn};

use crate::external::retry::{is_transient_reqwest_error, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EvmLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct EvmRpcClient {
    rpc_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl EvmRpcClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(100)
            .build()
            .expect("failed to build reqwest client");

        Self {
            rpc_url: rpc_url.into(),
            client,
            retry: RetryPolicy::default(),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let outcome = self
            .retry
            .run(
                |e| e.downcast_ref::<reqwest::Error>().map(is_transient_reqwest_error).unwrap_or(false),
                || async {
                    let resp = self
                        .client
                        .post(&self.rpc_url)
                        .json(&body)
                        .send()
                        .await
                        .with_context(|| format!("{method} request failed"))?;
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        anyhow::bail!("{} returned {}: {}", method, status, text);
                    }
                    let parsed: JsonRpcResponse<serde_json::Value> =
                        resp.json().await.with_context(|| format!("failed to parse {method} response"))?;
                    if let Some(err) = parsed.error {
                        anyhow::bail!("{} rpc error: {}", method, err);
                    }
                    parsed.result.with_context(|| format!("{method} response missing result"))
                },
            )
            .await;

        let raw = outcome.into_result()?;
        serde_json::from_value(raw).with_context(|| format!("unexpected {method} result shape"))
    }

    #[instrument(skip(self))]
    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    #[instrument(skip(self))]
    pub async fn get_balance(&self, address: &str) -> Result<f64> {
        let hex: String = self.call("eth_getBalance", json!([address, "latest"])).await?;
        let wei = parse_hex_u128(&hex)?;
        Ok(wei as f64 / 1e18)
    }

    /// `eth_getLogs` for one topic0 over `[from_block, to_block]`, filtered
    /// server-side to logs emitted by any contract (no address filter — the
    /// wallet tracker filters indexed `from`/`to` client-side after decoding).
    #[instrument(skip(self))]
    pub async fn get_logs(&self, topic0: &str, from_block: u64, to_block: u64) -> Result<Vec<EvmLog>> {
        let params = json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
            "topics": [topic0],
        }]);
        let raw: Vec<serde_json::Value> = self.call("eth_getLogs", params).await?;

        let mut logs = Vec::with_capacity(raw.len());
        for entry in raw {
            let address = entry["address"].as_str().unwrap_or_default().to_string();
            let topics: Vec<String> = entry["topics"]
                .as_array()
                .map(|arr| arr.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let data = entry["data"].as_str().unwrap_or("0x").to_string();
            let transaction_hash = entry["transactionHash"].as_str().unwrap_or_default().to_string();
            let block_number = entry["blockNumber"]
                .as_str()
                .and_then(|s| parse_hex_u64(s).ok())
                .unwrap_or(0);

            if transaction_hash.is_empty() {
                warn!("skipping log entry with no transaction hash");
                continue;
            }

            logs.push(EvmLog {
                address,
                topics,
                data,
                transaction_hash,
                block_number,
            });
        }
        Ok(logs)
    }

    /// `eth_call` against a contract with a bare 4-byte selector and no
    /// arguments — covers `name()` (0x06fdde03), `symbol()` (0x95d89b41),
    /// and `decimals()` (0x313ce567).
    async fn call_contract(&self, address: &str, selector: &str) -> Result<String> {
        let params = json!([{ "to": address, "data": selector }, "latest"]);
        self.call("eth_call", params).await
    }

    #[instrument(skip(self))]
    pub async fn token_decimals(&self, address: &str) -> Result<u8> {
        let raw = self.call_contract(address, "0x313ce567").await?;
        let value = parse_hex_u128(&raw).unwrap_or(18);
        Ok(value as u8)
    }

    #[instrument(skip(self))]
    pub async fn token_symbol(&self, address: &str) -> Result<String> {
        let raw = self.call_contract(address, "0x95d89b41").await?;
        Ok(decode_abi_string(&raw).unwrap_or_else(|| "UNKNOWN".to_string()))
    }

    #[instrument(skip(self))]
    pub async fn token_name(&self, address: &str) -> Result<String> {
        let raw = self.call_contract(address, "0x06fdde03").await?;
        Ok(decode_abi_string(&raw).unwrap_or_else(|| "Unknown Token".to_string()))
    }
}

fn parse_hex_u64(hex: &str) -> Result<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16).context("failed to parse hex u64")
}

fn parse_hex_u128(hex: &str) -> Result<u128> {
    u128::from_str_radix(hex.trim_start_matches("0x"), 16).context("failed to parse hex u128")
}

/// Decode a dynamic ABI `string` return value: 32-byte offset word, 32-byte
/// length word, then the UTF-8 bytes padded to a 32-byte boundary.
fn decode_abi_string(hex: &str) -> Option<String> {
    let data = hex.trim_start_matches("0x");
    let bytes = hex_decode(data)?;
    if bytes.len() < 64 {
        return None;
    }
    let len = u64::from_be_bytes(bytes[56..64].try_into().ok()?) as usize;
    let start = 64;
    let end = start.checked_add(len)?;
    if end > bytes.len() {
        return None;
    }
    String::from_utf8(bytes[start..end].to_vec())
        .ok()
        .map(|s| s.trim_end_matches('\0').to_string())
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Keccak-256 of a canonical function signature string, e.g.
/// `"Transfer(address,address,uint256)"`, returned as a `0x`-prefixed hex
/// topic — computed once at tracker construction rather than hardcoded, per
/// §4.6's design note.
pub fn event_topic(signature: &str) -> String {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(66);
    out.push_str("0x");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_topic_matches_known_value() {
        // Well-known ERC-20 Transfer topic hash, used across every EVM
        // indexer as the canonical sanity check for a Keccak-256 helper.
        assert_eq!(
            event_topic("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn hex_u64_parses_0x_prefixed() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
    }

    #[test]
    fn abi_string_decodes_padded_value() {
        // offset word (0x20), length word (4), then "USDC" right-padded to
        // a 32-byte boundary — built programmatically to avoid transcription
        // errors in a hand-written hex literal.
        let mut bytes = vec![0u8; 32];
        bytes[31] = 0x20;
        bytes.extend(std::iter::repeat(0u8).take(31).chain(std::iter::once(4u8)));
        let mut word = b"USDC".to_vec();
        word.resize(32, 0);
        bytes.extend(word);

        let hex = format!("0x{}", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>());
        assert_eq!(decode_abi_string(&hex), Some("USDC".to_string()));
    }
}
