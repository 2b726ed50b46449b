// =============================================================================
// Price Client — CoinGecko-shaped price API
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::external::retry::{is_transient_reqwest_error, RetryPolicy};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PriceQuote {
    pub usd: f64,
    #[serde(rename = "usd_24h_change", default)]
    pub usd_24h_change: f64,
    #[serde(rename = "usd_24h_vol", default)]
    pub usd_24h_vol: f64,
}

#[derive(Clone)]
pub struct PriceClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl PriceClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(100)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            api_key,
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// `GET /simple/price?ids=<ids>&vs_currencies=usd&include_24hr_change=true&include_24hr_vol=true`.
    ///
    /// Returns the raw id -> quote map; callers remap ids back to
    /// user-facing symbols by case-insensitive matching since CoinGecko
    /// normalizes ids to lowercase.
    #[instrument(skip(self))]
    pub async fn simple_price(&self, ids: &[String]) -> Result<HashMap<String, PriceQuote>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids.join(",");
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd&include_24hr_change=true&include_24hr_vol=true",
            self.base_url, joined
        );

        let outcome = self
            .retry
            .run(
                |e| e.downcast_ref::<reqwest::Error>().map(is_transient_reqwest_error).unwrap_or(false),
                || async {
                    let mut req = self.client.get(&url);
                    if let Some(key) = &self.api_key {
                        req = req.header("x-cg-demo-api-key", key.as_str());
                    }
                    let resp = req.send().await.context("price API request failed")?;
                    let status = resp.status();
                    let body: serde_json::Value =
                        resp.json().await.context("failed to parse price API response")?;
                    if !status.is_success() {
                        anyhow::bail!("price API returned {}: {}", status, body);
                    }
                    Ok(body)
                },
            )
            .await;

        let body = outcome.into_result()?;
        let quotes: HashMap<String, PriceQuote> =
            serde_json::from_value(body).context("unexpected price API response shape")?;

        debug!(count = quotes.len(), "prices fetched");
        Ok(quotes)
    }
}
