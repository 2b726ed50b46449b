// =============================================================================
// Airdrop Watcher — wildcard or substring matching against announcement text
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::context::Context;
use crate::models::{topics, MatchData, MatchEntry, Rule, RuleMatch, WatchType};
use crate::watchers::base::{Watcher, WatcherRuntime};

const WILDCARD: &str = "*";

pub struct AirdropWatcher {
    pub runtime: Arc<WatcherRuntime>,
}

impl AirdropWatcher {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            runtime: Arc::new(WatcherRuntime::new(ctx, WatchType::Airdrop)),
        })
    }
}

#[async_trait]
impl Watcher for AirdropWatcher {
    fn watch_type(&self) -> WatchType {
        WatchType::Airdrop
    }

    fn runtime(&self) -> &Arc<WatcherRuntime> {
        &self.runtime
    }

    fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.ctx.config.watch.airdrop_interval_secs)
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

        // The alerts feed wants non-wildcard project names; a wallet-wide
        // wildcard rule means "everything", which the API expresses as an
        // empty `crypto` list.
        let non_wildcard: Vec<String> = targets.iter().filter(|t| t.as_str() != WILDCARD).cloned().collect();
        let query = if non_wildcard.len() == targets.len() { non_wildcard } else { Vec::new() };

        let alerts = self
            .runtime
            .ctx
            .alerts_client
            .airdrop_alerts(&query)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "airdrop alerts fetch failed — skipping this tick");
                Vec::new()
            });

        if alerts.is_empty() {
            return Ok(());
        }

        for rule in rules.values() {
            let mut entries = Vec::new();
            let has_wildcard = rule.target.iter().any(|t| t == WILDCARD);

            for alert in &alerts {
                let matched = if has_wildcard {
                    true
                } else {
                    rule.target
                        .iter()
                        .any(|t| alert.text.to_lowercase().contains(&t.to_lowercase()))
                };

                if matched {
                    entries.push(MatchEntry::AlertText {
                        token: None,
                        message: alert.text.clone(),
                        data: Some(serde_json::json!({ "post_link": alert.post_link, "text": alert.text })),
                    });
                }
            }

            if !entries.is_empty() {
                let rule_match = RuleMatch {
                    rule: rule.clone(),
                    match_data: MatchData { matches: entries },
                    matched_at: Utc::now(),
                };
                let topic = topics::rule_matched(WatchType::Airdrop);
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
    use crate::external::alerts_client::AlertItem;
    use crate::models::{new_rule_id, NotifyChannel};
    use std::collections::HashMap as Map;

    fn rule_with_targets(targets: Vec<&str>) -> Rule {
        Rule {
            rule_id: new_rule_id(),
            user_id: "u1".to_string(),
            watch_type: WatchType::Airdrop,
            target: targets.into_iter().map(String::from).collect(),
            condition: None,
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

    fn alert(text: &str) -> AlertItem {
        AlertItem {
            text: text.to_string(),
            post_link: Some("https://example.com".to_string()),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn wildcard_rule_matches_any_alert() {
        let rule = rule_with_targets(vec!["*"]);
        assert!(rule.target.iter().any(|t| t == WILDCARD));
        let alerts = vec![alert("Totally unrelated project airdrop")];
        let matched = alerts.iter().any(|a| {
            rule.target.iter().any(|t| t == WILDCARD) || rule.target.iter().any(|t| a.text.to_lowercase().contains(&t.to_lowercase()))
        });
        assert!(matched);
    }

    #[test]
    fn specific_target_requires_substring_match() {
        let rule = rule_with_targets(vec!["zkSync"]);
        let alerts = vec![alert("zkSync launches new airdrop campaign"), alert("Arbitrum news")];
        let matched: Vec<_> = alerts
            .iter()
            .filter(|a| rule.target.iter().any(|t| a.text.to_lowercase().contains(&t.to_lowercase())))
            .collect();
        assert_eq!(matched.len(), 1);
    }
}
