// =============================================================================
// Token Watcher — price-threshold, price-change, and text-alert conditions
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use crate::context::Context;
use crate::external::price_client::PriceQuote;
use crate::models::{topics, MatchData, MatchEntry, Rule, RuleMatch, WatchType};
use crate::watchers::base::{Watcher, WatcherRuntime};

const PRICE_CHANGE_THRESHOLD_PCT: f64 = 5.0;
const PRICE_CHANGE_24H_THRESHOLD_PCT: f64 = 10.0;

pub struct TokenWatcher {
    pub runtime: Arc<WatcherRuntime>,
    /// Last observed USD price per target symbol — owned exclusively by this
    /// watcher, per §5's "shared mutable caches" design note.
    price_cache: RwLock<HashMap<String, f64>>,
}

impl TokenWatcher {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            runtime: Arc::new(WatcherRuntime::new(ctx, WatchType::Token)),
            price_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve the price-API id for `target`: prefer `target_data.coin_gc_id`
    /// recorded at registration, falling back to the lowercased symbol for
    /// rules stored before that requirement was enforced (Open Question 1).
    fn resolve_id(rule: &Rule, target: &str) -> String {
        rule.target_data
            .get(target)
            .and_then(|v| v.get("coin_gc_id"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                warn!(target, rule_id = %rule.rule_id, "token rule missing coin_gc_id — falling back to lowercased symbol");
                target.to_lowercase()
            })
    }
}

#[async_trait]
impl Watcher for TokenWatcher {
    fn watch_type(&self) -> WatchType {
        WatchType::Token
    }

    fn runtime(&self) -> &Arc<WatcherRuntime> {
        &self.runtime
    }

    fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.ctx.config.watch.token_interval_secs)
    }

    #[instrument(skip(self, targets))]
    async fn watch_targets(&self, targets: &[String]) -> anyhow::Result<()> {
        // Gather every rule registered against any watched target, keyed by
        // rule_id so a multi-target rule is evaluated once per tick.
        let mut rules: HashMap<String, Rule> = HashMap::new();
        let mut id_by_target: HashMap<String, String> = HashMap::new();
        for target in targets {
            for rule in self.runtime.rules_for_target(target).await {
                id_by_target
                    .entry(target.clone())
                    .or_insert_with(|| Self::resolve_id(&rule, target));
                rules.insert(rule.rule_id.clone(), rule);
            }
        }

        if rules.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = id_by_target.values().cloned().collect();
        let quotes = self.runtime.ctx.price_client.simple_price(&ids).await?;

        let alerts = self
            .runtime
            .ctx
            .alerts_client
            .token_alerts(targets)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "token alerts fetch failed — continuing with price-only evaluation");
                Vec::new()
            });

        for rule in rules.values() {
            let mut entries = Vec::new();

            for target in &rule.target {
                if !targets.contains(target) {
                    continue;
                }

                entries.extend(evaluate_alerts(rule, target, &alerts));

                let Some(id) = id_by_target.get(target) else { continue };
                let Some(quote) = quotes.get(id) else { continue };
                let prev_price = self.price_cache.read().get(target).copied();
                entries.extend(evaluate_price(rule, target, quote, prev_price));
            }

            if !entries.is_empty() {
                let rule_match = RuleMatch {
                    rule: rule.clone(),
                    match_data: MatchData { matches: entries },
                    matched_at: Utc::now(),
                };
                let topic = topics::rule_matched(WatchType::Token);
                if let Err(e) = self.runtime.ctx.broker.publish(&topic, &rule_match).await {
                    warn!(rule_id = %rule.rule_id, error = %e, "failed to publish rule_matched");
                }
            }
        }

        // Update the price cache after evaluation so `price_change` compares
        // against the price observed on the *previous* tick, per §8.
        let mut cache = self.price_cache.write();
        for (target, id) in &id_by_target {
            if let Some(quote) = quotes.get(id) {
                cache.insert(target.clone(), quote.usd);
            }
        }

        Ok(())
    }
}

fn evaluate_alerts(rule: &Rule, target: &str, alerts: &[crate::external::alerts_client::AlertItem]) -> Vec<MatchEntry> {
    let mut out = Vec::new();
    for alert in alerts {
        if !alert.text.to_lowercase().contains(&target.to_lowercase()) {
            continue;
        }
        if let Some(filter) = rule.condition.as_ref().and_then(|c| c.get("alert")) {
            if !alert_matches_filter(alert, filter) {
                continue;
            }
        }
        out.push(MatchEntry::AlertText {
            token: Some(target.to_string()),
            message: alert.text.clone(),
            data: Some(serde_json::json!({ "post_link": alert.post_link })),
        });
    }
    out
}

fn alert_matches_filter(alert: &crate::external::alerts_client::AlertItem, filter: &serde_json::Value) -> bool {
    for field in ["level", "type", "source"] {
        if let Some(expected) = filter.get(field).and_then(|v| v.as_str()) {
            let actual = alert.extra.get(field).and_then(|v| v.as_str());
            if actual != Some(expected) {
                return false;
            }
        }
    }
    true
}

fn evaluate_price(rule: &Rule, target: &str, quote: &PriceQuote, prev_price: Option<f64>) -> Vec<MatchEntry> {
    let mut out = Vec::new();

    if let Some(condition) = &rule.condition {
        if let Some(gt) = condition.get("gt").and_then(|v| v.as_f64()) {
            if quote.usd > gt {
                out.push(MatchEntry::PriceAbove {
                    token: target.to_string(),
                    value: quote.usd,
                    threshold: gt,
                });
            }
        }
        if let Some(lt) = condition.get("lt").and_then(|v| v.as_f64()) {
            if quote.usd < lt {
                out.push(MatchEntry::PriceBelow {
                    token: target.to_string(),
                    value: quote.usd,
                    threshold: lt,
                });
            }
        }
    }

    if let Some(prev) = prev_price {
        if prev > 0.0 {
            let pct = ((quote.usd - prev) / prev) * 100.0;
            if pct.abs() >= PRICE_CHANGE_THRESHOLD_PCT {
                out.push(MatchEntry::PriceChange {
                    token: target.to_string(),
                    old_price: prev,
                    new_price: quote.usd,
                    value: pct,
                });
            }
        }
    }

    if quote.usd_24h_change.abs() >= PRICE_CHANGE_24H_THRESHOLD_PCT {
        out.push(MatchEntry::PriceChange24h {
            token: target.to_string(),
            value: quote.usd_24h_change,
            current_price: quote.usd,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_rule_id, NotifyChannel};
    use std::collections::HashMap as Map;

    fn rule_with_condition(condition: Option<serde_json::Value>) -> Rule {
        Rule {
            rule_id: new_rule_id(),
            user_id: "u1".to_string(),
            watch_type: WatchType::Token,
            target: vec!["BTC".to_string()],
            condition,
            notify_channel: NotifyChannel::Telegram,
            notify_id: "1".to_string(),
            target_data: Map::new(),
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: "active".to_string(),
            active: true,
        }
    }

    #[test]
    fn price_above_triggers_when_gt_exceeded() {
        let rule = rule_with_condition(Some(serde_json::json!({ "gt": 100000.0 })));
        let quote = PriceQuote { usd: 105000.0, usd_24h_change: 3.0, usd_24h_vol: 1.0 };
        let entries = evaluate_price(&rule, "BTC", &quote, None);
        assert!(matches!(entries[0], MatchEntry::PriceAbove { value, threshold, .. } if value == 105000.0 && threshold == 100000.0));
    }

    #[test]
    fn price_below_threshold_not_triggered_when_above() {
        let rule = rule_with_condition(Some(serde_json::json!({ "lt": 50000.0 })));
        let quote = PriceQuote { usd: 105000.0, usd_24h_change: 0.0, usd_24h_vol: 1.0 };
        let entries = evaluate_price(&rule, "BTC", &quote, None);
        assert!(entries.is_empty());
    }

    #[test]
    fn tick_over_tick_change_above_threshold_triggers() {
        let rule = rule_with_condition(None);
        let quote = PriceQuote { usd: 110.0, usd_24h_change: 0.0, usd_24h_vol: 1.0 };
        let entries = evaluate_price(&rule, "BTC", &quote, Some(100.0));
        assert!(entries.iter().any(|e| matches!(e, MatchEntry::PriceChange { .. })));
    }

    #[test]
    fn tick_over_tick_change_below_threshold_is_silent() {
        let rule = rule_with_condition(None);
        let quote = PriceQuote { usd: 102.0, usd_24h_change: 0.0, usd_24h_vol: 1.0 };
        let entries = evaluate_price(&rule, "BTC", &quote, Some(100.0));
        assert!(entries.is_empty());
    }

    #[test]
    fn change_24h_above_threshold_triggers() {
        let rule = rule_with_condition(None);
        let quote = PriceQuote { usd: 100.0, usd_24h_change: 12.0, usd_24h_vol: 1.0 };
        let entries = evaluate_price(&rule, "BTC", &quote, None);
        assert!(entries.iter().any(|e| matches!(e, MatchEntry::PriceChange24h { .. })));
    }

    #[test]
    fn resolve_id_prefers_coin_gc_id() {
        let mut rule = rule_with_condition(None);
        rule.target_data.insert("BTC".to_string(), serde_json::json!({ "coin_gc_id": "bitcoin" }));
        assert_eq!(TokenWatcher::resolve_id(&rule, "BTC"), "bitcoin");
    }

    #[test]
    fn resolve_id_falls_back_to_lowercased_symbol() {
        let rule = rule_with_condition(None);
        assert_eq!(TokenWatcher::resolve_id(&rule, "BTC"), "btc");
    }
}
