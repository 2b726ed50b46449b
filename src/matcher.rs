// =============================================================================
// Rule Matcher — turns raw watcher matches into rendered notifications
// =============================================================================
//
// The Rust analogue of the reference implementation's `RuleMatcher`: one
// subscription per watch type on `<t>_watch:rule_matched`, a short-window
// dedup against the prior match_data, message rendering per §6's templates,
// and a publish onto `<t>_watch:send_notify`. Most of the Python's
// `validate_match` collapses here because `MatchEntry` already enforces
// condition-specific required fields at the type level — deserializing a
// `RuleMatch` at all is the validation.
// =============================================================================

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::context::Context;
use crate::models::{topics, MatchEntry, Notification, NotificationMetadata, NotificationStatus, Rule, RuleMatch, WatchType};
use crate::shutdown::Shutdown;

pub struct RuleMatcher {
    ctx: Arc<Context>,
}

impl RuleMatcher {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn start(self: &Arc<Self>, shutdown: Shutdown) {
        for watch_type in WatchType::all() {
            let matcher = self.clone();
            let topic = topics::rule_matched(watch_type);
            self.ctx.broker.subscribe(
                topic,
                Arc::new(move |_channel, payload| {
                    let matcher = matcher.clone();
                    Box::pin(async move {
                        matcher.process_match(watch_type, payload).await;
                    })
                }),
                shutdown.clone(),
            );
        }
    }

    #[instrument(skip(self, payload), fields(%watch_type))]
    async fn process_match(&self, watch_type: WatchType, payload: serde_json::Value) {
        let rule_match: RuleMatch = match serde_json::from_value(payload) {
            Ok(rm) => rm,
            Err(e) => {
                warn!(error = %e, "dropping undecodable rule_matched payload");
                return;
            }
        };

        if rule_match.match_data.matches.is_empty() {
            return;
        }

        if self.is_duplicate(watch_type, &rule_match).await {
            info!(rule_id = %rule_match.rule.rule_id, "skipping duplicate match window");
            return;
        }

        let Some(message) = render_notification(watch_type, &rule_match.match_data.matches, &self.ctx.config) else {
            warn!(rule_id = %rule_match.rule.rule_id, "no renderable message for match — dropping");
            return;
        };

        let notification = Notification {
            user: rule_match.rule.notify_id.clone(),
            channel: rule_match.rule.notify_channel,
            message,
            metadata: NotificationMetadata {
                rule_id: rule_match.rule.rule_id.clone(),
                user_id: rule_match.rule.user_id.clone(),
                conversation_id: conversation_id_of(&rule_match.rule),
                parse_mode: "HTML".to_string(),
                disable_web_page_preview: true,
            },
            created_at: rule_match.matched_at,
            status: NotificationStatus::Pending,
        };

        let topic = topics::send_notify(watch_type);
        if let Err(e) = self.ctx.broker.publish(&topic, &notification).await {
            warn!(rule_id = %rule_match.rule.rule_id, error = %e, "failed to publish send_notify");
        }
    }

    /// Drops a match identical to the last one seen for this rule within
    /// the dedup window, per §4.8. Dedup state is stored regardless, so a
    /// genuinely new match always resets the window.
    async fn is_duplicate(&self, watch_type: WatchType, rule_match: &RuleMatch) -> bool {
        let key = topics::notify_last_key(watch_type, &rule_match.rule.rule_id);

        let current = match serde_json::to_value(&rule_match.match_data) {
            Ok(v) => sorted_keys_json(&v),
            Err(_) => return false,
        };

        let is_dup = match self.ctx.broker.get(&key).await {
            Ok(Some(prev)) => prev == current,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to read dedup key — proceeding without dedup");
                false
            }
        };

        if !is_dup {
            let ttl = self.ctx.config.notification.matcher_dedup_window_secs.max(0) as u64;
            if let Err(e) = self.ctx.broker.set(&key, &current, Some(ttl)).await {
                warn!(error = %e, "failed to persist dedup key");
            }
        }

        is_dup
    }
}

fn conversation_id_of(rule: &Rule) -> String {
    rule.metadata
        .as_ref()
        .and_then(|m| m.get("conversation_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Canonical sorted-keys JSON text, used as the dedup comparison value —
/// `serde_json::Value`'s `Serialize` impl already emits map keys in
/// `BTreeMap` order once round-tripped through `to_value`, since
/// `serde_json::Map` is backed by a `BTreeMap` unless the `preserve_order`
/// feature is enabled (it isn't here).
fn sorted_keys_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn render_notification(watch_type: WatchType, matches: &[MatchEntry], config: &Config) -> Option<String> {
    let mut lines: Vec<String> = matches.iter().filter_map(|m| render_entry(m, config)).collect();
    if lines.is_empty() {
        return None;
    }
    if watch_type == WatchType::Airdrop {
        lines.insert(0, "🔔 <b>Airdrop Alert</b>".to_string());
    }
    Some(lines.join("\n"))
}

fn render_entry(entry: &MatchEntry, config: &Config) -> Option<String> {
    match entry {
        MatchEntry::PriceAbove { token, value, threshold } => Some(format!(
            "<b>{token}</b> price above ${} (current: ${})",
            format_money(*threshold),
            format_money(*value)
        )),
        MatchEntry::PriceBelow { token, value, threshold } => Some(format!(
            "<b>{token}</b> price below ${} (current: ${})",
            format_money(*threshold),
            format_money(*value)
        )),
        MatchEntry::PriceChange { token, old_price, new_price, value } => {
            let direction = if *value > 0.0 { "increased" } else { "decreased" };
            Some(format!(
                "<b>{token}</b> {direction} by {:.1}% (from ${} → ${})",
                value.abs(),
                format_money(*old_price),
                format_money(*new_price)
            ))
        }
        MatchEntry::PriceChange24h { token, value, current_price } => {
            let direction = if *value > 0.0 { "increased" } else { "decreased" };
            Some(format!(
                "<b>{token}</b> {direction} by {:.1}% in 24h (current: ${})",
                value.abs(),
                format_money(*current_price)
            ))
        }
        MatchEntry::AlertText { message, .. } => {
            if message.is_empty() {
                None
            } else {
                Some(format!("• {message}"))
            }
        }
        MatchEntry::NativeTransfer { wallet, chain, from, to, amount, symbol, balance, tx_hash } => {
            let scan = config.scan_url(chain.as_str());
            Some(format!(
                "🔔 <b>Native Transfer</b> on <b>{}</b>\n\
                 • Wallet: <a href='{scan}/address/{wallet}'>{wallet}</a>\n\
                 • From: <a href='{scan}/address/{from}'>{from}</a>\n\
                 • To: <a href='{scan}/address/{to}'>{to}</a>\n\
                 • Amount: {amount} {symbol}\n\
                 • Balance: {balance} {symbol}\n\
                 • TX: <a href='{scan}/tx/{tx_hash}'>{tx_hash}</a>",
                chain.as_str().to_uppercase(),
            ))
        }
        MatchEntry::TokenTransfer { wallet, chain, from, to, amount, token_symbol, contract_address, tx_hash } => {
            let scan = config.scan_url(chain.as_str());
            Some(format!(
                "🔔 <b>Token Transfer</b> on <b>{}</b>\n\
                 • Wallet: <a href='{scan}/address/{wallet}'>{wallet}</a>\n\
                 • From: <a href='{scan}/address/{from}'>{from}</a>\n\
                 • To: <a href='{scan}/address/{to}'>{to}</a>\n\
                 • Type: ERC-20\n\
                 • CA: <a href='{scan}/token/{contract_address}'>{contract_address}</a>\n\
                 • Amount: {amount} {token_symbol}\n\
                 • TX: <a href='{scan}/tx/{tx_hash}'>{tx_hash}</a>",
                chain.as_str().to_uppercase(),
            ))
        }
        MatchEntry::TokenTrade { wallet, chain, side, token_symbol, token_amount, counter_symbol, counter_amount, dex, tx_hash } => {
            let scan = config.scan_url(chain.as_str());
            let native = config.native_symbol(chain.as_str());
            let sold_native = counter_symbol.eq_ignore_ascii_case(native);
            let header = if sold_native { "Token Bought" } else { "Token Swapped" };
            let counter_line = if sold_native {
                format!("• Received: {counter_amount} {counter_symbol}")
            } else {
                format!("• Bought: {counter_amount} {counter_symbol}")
            };
            Some(format!(
                "🔔 <b>{header}</b> on <b>{}</b>\n\
                 • Wallet: <a href='{scan}/address/{wallet}'>{wallet}</a>\n\
                 • Sold: {token_amount} {token_symbol} ({side})\n\
                 {counter_line}\n\
                 • Dex: {dex}\n\
                 • TX: <a href='{scan}/tx/{tx_hash}'>{tx_hash}</a>",
                chain.as_str().to_uppercase(),
            ))
        }
        MatchEntry::NftTransfer { wallet, chain, from, to, collection, token_id, amount, tx_hash } => {
            let scan = config.scan_url(chain.as_str());
            Some(format!(
                "🔔 <b>NFT Transfer</b> on <b>{}</b>\n\
                 • Wallet: <a href='{scan}/address/{wallet}'>{wallet}</a>\n\
                 • From: <a href='{scan}/address/{from}'>{from}</a>\n\
                 • To: <a href='{scan}/address/{to}'>{to}</a>\n\
                 • Collection: {collection} #{token_id}\n\
                 • Amount: {amount}\n\
                 • TX: <a href='{scan}/tx/{tx_hash}'>{tx_hash}</a>",
                chain.as_str().to_uppercase(),
            ))
        }
        MatchEntry::NftTrade { wallet, chain, collection, token_id, price_token, price_amount, tx_hash, .. } => {
            let scan = config.scan_url(chain.as_str());
            Some(format!(
                "🔔 <b>NFT Trade</b> on <b>{}</b>\n\
                 • Wallet: <a href='{scan}/address/{wallet}'>{wallet}</a>\n\
                 • Collection: {collection} #{token_id}\n\
                 • Price: {price_amount} {price_token}\n\
                 • TX: <a href='{scan}/tx/{tx_hash}'>{tx_hash}</a>",
                chain.as_str().to_uppercase(),
            ))
        }
    }
}

/// Hand-rolled two-decimal, comma-grouped dollar formatting — no crate in
/// the dependency stack covers locale-aware number formatting, and this is
/// the only place that needs it.
fn format_money(value: f64) -> String {
    let negative = value < 0.0;
    let value = value.abs();
    let rounded = format!("{value:.2}");
    let (int_part, frac_part) = rounded.split_once('.').unwrap_or((rounded.as_str(), "00"));

    let mut grouped = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();

    if negative {
        format!("-{grouped}.{frac_part}")
    } else {
        format!("{grouped}.{frac_part}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_money_groups_thousands() {
        assert_eq!(format_money(65000.0), "65,000.00");
        assert_eq!(format_money(999.5), "999.50");
        assert_eq!(format_money(-1234.5), "-1,234.50");
        assert_eq!(format_money(0.0), "0.00");
    }

    #[test]
    fn render_price_above_matches_spec_template() {
        let entry = MatchEntry::PriceAbove { token: "BTC".to_string(), value: 65000.0, threshold: 60000.0 };
        let config = Config::default();
        let rendered = render_entry(&entry, &config).unwrap();
        assert_eq!(rendered, "<b>BTC</b> price above $60,000.00 (current: $65,000.00)");
    }

    #[test]
    fn render_price_change_picks_direction_from_sign() {
        let entry = MatchEntry::PriceChange { token: "ETH".to_string(), old_price: 3000.0, new_price: 3150.0, value: 5.0 };
        let config = Config::default();
        let rendered = render_entry(&entry, &config).unwrap();
        assert_eq!(rendered, "<b>ETH</b> increased by 5.0% (from $3,000.00 → $3,150.00)");
    }

    #[test]
    fn render_airdrop_prepends_header() {
        let matches = vec![MatchEntry::AlertText {
            token: None,
            message: "zkSync airdrop is live".to_string(),
            data: None,
        }];
        let config = Config::default();
        let rendered = render_notification(WatchType::Airdrop, &matches, &config).unwrap();
        assert_eq!(rendered, "🔔 <b>Airdrop Alert</b>\n• zkSync airdrop is live");
    }

    #[test]
    fn empty_alert_message_yields_no_line() {
        let entry = MatchEntry::AlertText { token: None, message: String::new(), data: None };
        let config = Config::default();
        assert!(render_entry(&entry, &config).is_none());
    }
}
