// =============================================================================
// Solana RPC Client — thin JSON-RPC wrapper used by the Solana wallet tracker
// =============================================================================

use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::external::retry::{is_transient_reqwest_error, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaSignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenBalance {
    #[serde(rename = "accountIndex")]
    pub account_index: u64,
    pub mint: String,
    #[serde(rename = "uiTokenAmount")]
    pub ui_token_amount: UiTokenAmount,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UiTokenAmount {
    #[serde(default)]
    pub ui_amount: Option<f64>,
    #[serde(default)]
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaTransaction {
    pub slot: u64,
    pub meta: SolanaTransactionMeta,
    pub transaction: SolanaTransactionInner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaTransactionMeta {
    pub err: Option<serde_json::Value>,
    pub fee: u64,
    #[serde(rename = "preBalances")]
    pub pre_balances: Vec<u64>,
    #[serde(rename = "postBalances")]
    pub post_balances: Vec<u64>,
    #[serde(rename = "preTokenBalances", default)]
    pub pre_token_balances: Vec<TokenBalance>,
    #[serde(rename = "postTokenBalances", default)]
    pub post_token_balances: Vec<TokenBalance>,
    #[serde(rename = "logMessages", default)]
    pub log_messages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaTransactionInner {
    pub message: SolanaTransactionMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaTransactionMessage {
    #[serde(rename = "accountKeys", default)]
    pub account_keys: Vec<SolanaAccountKey>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SolanaAccountKey {
    Plain(String),
    Parsed { pubkey: String },
}

impl SolanaAccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            SolanaAccountKey::Plain(s) => s,
            SolanaAccountKey::Parsed { pubkey } => pubkey,
        }
    }
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct SolanaRpcClient {
    rpc_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl SolanaRpcClient {
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
    pub async fn get_slot(&self) -> Result<u64> {
        self.call("getSlot", json!([{ "commitment": "finalized" }])).await
    }

    #[instrument(skip(self))]
    pub async fn get_balance(&self, address: &str) -> Result<u64> {
        let raw: serde_json::Value = self
            .call("getBalance", json!([address, { "commitment": "finalized" }]))
            .await?;
        raw["value"].as_u64().context("getBalance response missing value")
    }

    /// `getSignaturesForAddress` at finalized commitment, limit 20.
    #[instrument(skip(self))]
    pub async fn get_signatures_for_address(&self, address: &str) -> Result<Vec<SolanaSignatureInfo>> {
        self.call(
            "getSignaturesForAddress",
            json!([address, { "limit": 20, "commitment": "finalized" }]),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<SolanaTransaction>> {
        let raw: Option<serde_json::Value> = self
            .call(
                "getTransaction",
                json!([signature, { "encoding": "jsonParsed", "commitment": "finalized", "maxSupportedTransactionVersion": 0 }]),
            )
            .await?;
        match raw {
            Some(v) if !v.is_null() => {
                let tx = serde_json::from_value(v).context("unexpected getTransaction shape")?;
                Ok(Some(tx))
            }
            _ => Ok(None),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_account_info(&self, address: &str) -> Result<Option<serde_json::Value>> {
        let raw: serde_json::Value = self
            .call("getAccountInfo", json!([address, { "encoding": "jsonParsed", "commitment": "finalized" }]))
            .await?;
        Ok(raw.get("value").cloned().filter(|v| !v.is_null()))
    }
}

/// Known Solana DEX program IDs, used as a fallback when no log-message
/// substring marker matches. Not exhaustive — new DEX deployments simply
/// fall through to `"Unknown"`.
pub const SOLANA_DEX_PROGRAMS: &[(&str, &str)] = &[
    ("JUP6LkbZbjS1jKKwapdHNy74zcVw3SA7t3Qt1Mgn9HU", "Jupiter"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "Orca"),
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "Raydium"),
    ("9W959DqEETiGZocYWCQPaJ6sBmUzgfxXfqGeTEdp3aQP", "Orca"),
    ("EewxydAPCCVuNEyrVN68PuSYdQ7wKn27V9Gjeoi8dy3S", "Raydium"),
    ("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin", "Serum"),
    ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "Raydium"),
    ("27haf8L6oxUeXrHrgEgsexjSY5hbVUWEmvv9Nyxg8vQv", "Lifinity"),
    ("PhoeNiXZ8ByJGLkxNfZRnkUfjvmuYqLR89jjFHGqdXY", "Phoenix"),
];

/// Best-effort DEX name from transaction log messages, falling back to the
/// account-key/program-id table, then `"Unknown"`.
pub fn infer_dex_name(log_messages: &[String], account_keys: &[SolanaAccountKey]) -> String {
    const MARKERS: &[(&str, &str)] = &[
        ("jupiter", "Jupiter"),
        ("orca", "Orca"),
        ("raydium", "Raydium"),
        ("serum", "Serum"),
    ];
    for log in log_messages {
        let lower = log.to_lowercase();
        for (marker, name) in MARKERS {
            if lower.contains(marker) {
                return name.to_string();
            }
        }
    }
    for key in account_keys {
        let pk = key.pubkey();
        if let Some((_, name)) = SOLANA_DEX_PROGRAMS.iter().find(|(id, _)| *id == pk) {
            return name.to_string();
        }
    }
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_dex_name_matches_log_marker() {
        let logs = vec!["Program log: Instruction: Swap via Jupiter aggregator".to_string()];
        assert_eq!(infer_dex_name(&logs, &[]), "Jupiter");
    }

    #[test]
    fn infer_dex_name_falls_back_to_program_table() {
        let keys = vec![SolanaAccountKey::Plain(
            "JUP6LkbZbjS1jKKwapdHNy74zcVw3SA7t3Qt1Mgn9HU".to_string(),
        )];
        assert_eq!(infer_dex_name(&[], &keys), "Jupiter");
    }

    #[test]
    fn infer_dex_name_unknown_when_nothing_matches() {
        assert_eq!(infer_dex_name(&[], &[]), "Unknown");
    }
}
