// =============================================================================
// Alerts Clients — token-alert and airdrop-alert feeds
// =============================================================================
//
// Both are opaque external services (scraper/corpus workers, out of this
// crate's scope per §1) that this client only calls into. Response shape is
// the same loose `{text, ...}` document for both, so they share a struct.
// =============================================================================

use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::external::retry::{is_transient_reqwest_error, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct AlertItem {
    pub text: String,
    #[serde(default)]
    pub post_link: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The alerts feed wraps every response in `{success, data}` rather than
/// returning a bare array — mirrors the shape both `get_alert_data()` and
/// `get_airdrop_data()` unwrap in the original worker.
#[derive(Debug, Deserialize)]
struct AlertEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<AlertItem>,
}

impl AlertEnvelope {
    fn into_alerts(self) -> Vec<AlertItem> {
        if self.success {
            self.data
        } else {
            Vec::new()
        }
    }
}

#[derive(Serialize)]
struct TokenAlertRequest<'a> {
    level: &'a str,
    crypto: &'a [String],
}

#[derive(Serialize)]
struct AirdropAlertRequest<'a> {
    crypto: &'a [String],
    time: u32,
}

#[derive(Clone)]
pub struct AlertsClient {
    alert_url: String,
    airdrop_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl AlertsClient {
    pub fn new(alert_url: impl Into<String>, airdrop_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(100)
            .build()
            .expect("failed to build reqwest client");

        Self {
            alert_url: alert_url.into(),
            airdrop_url: airdrop_url.into(),
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// `POST {level: "0", crypto: <watching set>}` against the token alerts
    /// feed.
    #[instrument(skip(self))]
    pub async fn token_alerts(&self, crypto: &[String]) -> Result<Vec<AlertItem>> {
        let body = TokenAlertRequest { level: "0", crypto };
        let outcome = self
            .retry
            .run(
                |e| e.downcast_ref::<reqwest::Error>().map(is_transient_reqwest_error).unwrap_or(false),
                || async {
                    let resp = self
                        .client
                        .post(&self.alert_url)
                        .json(&body)
                        .send()
                        .await
                        .context("token alerts request failed")?;
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        anyhow::bail!("token alerts API returned {}: {}", status, text);
                    }
                    let envelope: AlertEnvelope =
                        resp.json().await.context("failed to parse token alerts response")?;
                    Ok(envelope)
                },
            )
            .await;
        Ok(outcome.into_result()?.into_alerts())
    }

    /// `POST {crypto: <non-wildcard targets>, time: 15}` against the airdrop
    /// alerts feed. Per §4.7, `crypto` is sent empty when the caller's
    /// target list contains the wildcard (the airdrop API's own convention
    /// for "everything").
    #[instrument(skip(self))]
    pub async fn airdrop_alerts(&self, crypto: &[String]) -> Result<Vec<AlertItem>> {
        let body = AirdropAlertRequest { crypto, time: 15 };
        let outcome = self
            .retry
            .run(
                |e| e.downcast_ref::<reqwest::Error>().map(is_transient_reqwest_error).unwrap_or(false),
                || async {
                    let resp = self
                        .client
                        .post(&self.airdrop_url)
                        .json(&body)
                        .send()
                        .await
                        .context("airdrop alerts request failed")?;
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        anyhow::bail!("airdrop alerts API returned {}: {}", status, text);
                    }
                    let envelope: AlertEnvelope =
                        resp.json().await.context("failed to parse airdrop alerts response")?;
                    Ok(envelope)
                },
            )
            .await;
        Ok(outcome.into_result()?.into_alerts())
    }
}
