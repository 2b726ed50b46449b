// =============================================================================
// Rule Processor — bridges persisted rules into the broker's live-watch index
// =============================================================================
//
// On startup, republishes every active rule from the store so watchers
// rebuild their watching sets after a restart (the crash-recovery path);
// this is idempotent because `hset` on an already-present field is a
// same-value overwrite, never a duplicate entry.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::models::{topics, Rule, WatchType};
use crate::shutdown::Shutdown;

pub struct RuleProcessor {
    ctx: Arc<Context>,
}

impl RuleProcessor {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Republish every active rule, then subscribe to `register_rule` for
    /// all three watch types. Returns once subscriptions are established;
    /// the subscriptions themselves run in spawned tasks for the lifetime
    /// of the process.
    #[instrument(skip(self))]
    pub async fn start(self: Arc<Self>, shutdown: Shutdown) -> anyhow::Result<()> {
        self.republish_active_rules().await;

        for watch_type in WatchType::all() {
            let this = self.clone();
            let shutdown = shutdown.clone();
            let topic = topics::register_rule(watch_type);
            self.ctx.broker.subscribe(
                topic,
                Arc::new(move |_channel, payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        match serde_json::from_value::<Rule>(payload) {
                            Ok(rule) => this.process_rule(rule).await,
                            Err(e) => warn!(error = %e, "dropping undecodable register_rule payload"),
                        }
                    })
                }),
                shutdown,
            );
        }

        info!("rule processor subscriptions established");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn republish_active_rules(&self) {
        match self.ctx.store.get_active(None).await {
            Ok(rules) => {
                info!(count = rules.len(), "republishing active rules on startup");
                for rule in rules {
                    let topic = topics::register_rule(rule.watch_type);
                    if let Err(e) = self.ctx.broker.publish(&topic, &rule).await {
                        warn!(rule_id = %rule.rule_id, error = %e, "failed to republish rule on startup");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to load active rules on startup — watchers start with an empty set until the next register_rule");
            }
        }
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id, watch_type = %rule.watch_type))]
    async fn process_rule(&self, mut rule: Rule) {
        canonicalize_airdrop_target(&mut rule);

        if let Err(reason) = validate_rule(&rule) {
            warn!(rule_id = %rule.rule_id, reason = %reason, "deactivating invalid rule");
            if let Err(e) = self
                .ctx
                .store
                .update_status(&rule.rule_id, "invalid", Some(&reason))
                .await
            {
                warn!(rule_id = %rule.rule_id, error = %e, "failed to mark invalid rule in store");
            }
            let _ = self.ctx.store.deactivate(&rule.rule_id).await;
            return;
        }

        let rule_json = match serde_json::to_string(&rule) {
            Ok(j) => j,
            Err(e) => {
                warn!(rule_id = %rule.rule_id, error = %e, "failed to serialize rule — dropping");
                return;
            }
        };

        for target in &rule.target {
            let key = topics::active_watch_key(rule.watch_type, target);
            if let Err(e) = self.ctx.broker.hset(&key, &rule.rule_id, &rule_json).await {
                warn!(rule_id = %rule.rule_id, target, error = %e, "failed to write watch entry");
                continue;
            }
            debug!(rule_id = %rule.rule_id, target, "watch entry written");
        }

        if let Err(e) = self.ctx.store.update_status(&rule.rule_id, "active", None).await {
            warn!(rule_id = %rule.rule_id, error = %e, "failed to mark rule active in store");
        }

        for target in &rule.target {
            let event = serde_json::json!({
                "rule_id": rule.rule_id,
                "watch_type": rule.watch_type.as_str(),
                "target": target,
            });
            let topic = topics::rule_activated(rule.watch_type);
            if let Err(e) = self.ctx.broker.publish(&topic, &event).await {
                warn!(rule_id = %rule.rule_id, error = %e, "failed to publish rule_activated");
            }
        }
    }
}

/// An airdrop rule with no target watches everything, canonicalized to the
/// wildcard before `validate_rule`'s general non-empty-target check would
/// otherwise reject it.
fn canonicalize_airdrop_target(rule: &mut Rule) {
    if rule.watch_type == WatchType::Airdrop && rule.target.is_empty() {
        rule.target = vec!["*".to_string()];
    }
}

/// Required-field and condition-shape validation per §4.3. Returns the
/// rejection reason on failure so it can be stored as `last_error`.
fn validate_rule(rule: &Rule) -> Result<(), String> {
    if rule.rule_id.trim().is_empty() {
        return Err("rule_id is empty".to_string());
    }
    if rule.user_id.trim().is_empty() {
        return Err("user_id is empty".to_string());
    }
    if rule.target.is_empty() {
        return Err("target is empty".to_string());
    }
    if rule.notify_id.trim().is_empty() {
        return Err("notify_id is empty".to_string());
    }

    if let Some(condition) = &rule.condition {
        if !condition.is_object() {
            return Err("condition must be a mapping".to_string());
        }
        if let Some(gt) = condition.get("gt") {
            if !gt.is_number() {
                return Err("condition.gt must be numeric".to_string());
            }
        }
        if let Some(lt) = condition.get("lt") {
            if !lt.is_number() {
                return Err("condition.lt must be numeric".to_string());
            }
        }
    }

    if rule.watch_type == WatchType::Token && !rule.has_coin_gc_ids() {
        return Err("token watch targets must have target_data.coin_gc_id populated".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_rule_id, NotifyChannel};
    use chrono::Utc;
    use std::collections::HashMap;

    fn base_rule() -> Rule {
        Rule {
            rule_id: new_rule_id(),
            user_id: "u1".to_string(),
            watch_type: WatchType::Wallet,
            target: vec!["0xabc".to_string()],
            condition: None,
            notify_channel: NotifyChannel::Telegram,
            notify_id: "123".to_string(),
            target_data: HashMap::new(),
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: "active".to_string(),
            active: true,
        }
    }

    #[test]
    fn rejects_empty_target() {
        let mut rule = base_rule();
        rule.target.clear();
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn canonicalizes_empty_airdrop_target_to_wildcard() {
        let mut rule = base_rule();
        rule.watch_type = WatchType::Airdrop;
        rule.target.clear();
        canonicalize_airdrop_target(&mut rule);
        assert_eq!(rule.target, vec!["*".to_string()]);
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn leaves_non_airdrop_empty_target_untouched() {
        let mut rule = base_rule();
        rule.target.clear();
        canonicalize_airdrop_target(&mut rule);
        assert!(rule.target.is_empty());
    }

    #[test]
    fn rejects_non_numeric_gt() {
        let mut rule = base_rule();
        rule.condition = Some(serde_json::json!({ "gt": "high" }));
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn accepts_type_any_catchall() {
        let mut rule = base_rule();
        rule.condition = Some(serde_json::json!({ "type": "any" }));
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn rejects_token_rule_missing_coin_gc_id() {
        let mut rule = base_rule();
        rule.watch_type = WatchType::Token;
        rule.target = vec!["BTC".to_string()];
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn accepts_token_rule_with_coin_gc_id() {
        let mut rule = base_rule();
        rule.watch_type = WatchType::Token;
        rule.target = vec!["BTC".to_string()];
        rule.target_data.insert("BTC".to_string(), serde_json::json!({ "coin_gc_id": "bitcoin" }));
        assert!(validate_rule(&rule).is_ok());
    }
}
