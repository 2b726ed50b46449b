// =============================================================================
// Models — shared data model for rules, matches, and notifications
// =============================================================================
//
// These types cross every component boundary in the pipeline: a `Rule` is
// written by the Rule Processor and read by every watcher; a `RuleMatch` is
// published by a watcher and read by the Matcher; a `Notification` is
// published by the Matcher and read by the Dispatcher. Every type here
// derives `Serialize`/`Deserialize` with field shapes matching the broker
// wire format exactly, so a message round-trips through plain JSON without
// any translation layer.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Watch type / notify channel
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchType {
    Token,
    Wallet,
    Airdrop,
}

impl WatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchType::Token => "token",
            WatchType::Wallet => "wallet",
            WatchType::Airdrop => "airdrop",
        }
    }

    pub fn all() -> [WatchType; 3] {
        [WatchType::Token, WatchType::Wallet, WatchType::Airdrop]
    }
}

impl std::fmt::Display for WatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    Telegram,
    Web,
    Discord,
}

impl NotifyChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyChannel::Telegram => "telegram",
            NotifyChannel::Web => "web",
            NotifyChannel::Discord => "discord",
        }
    }
}

impl std::fmt::Display for NotifyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chain identifier used by wallet watching; `Solana` is not EVM but shares
/// the same `WalletSnapshot`/`MatchEntry` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Bsc,
    Base,
    Solana,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Bsc => "bsc",
            Chain::Base => "base",
            Chain::Solana => "solana",
        }
    }

    pub fn is_evm(&self) -> bool {
        !matches!(self, Chain::Solana)
    }

    pub fn evm_chains() -> [Chain; 3] {
        [Chain::Ethereum, Chain::Bsc, Chain::Base]
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Rule
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub user_id: String,
    pub watch_type: WatchType,
    pub target: Vec<String>,

    #[serde(default)]
    pub condition: Option<serde_json::Value>,

    pub notify_channel: NotifyChannel,
    pub notify_id: String,

    #[serde(default)]
    pub target_data: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default = "default_rule_status")]
    pub status: String,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_rule_status() -> String {
    "active".to_string()
}

fn default_active() -> bool {
    true
}

impl Rule {
    /// True iff every target listed for a token-watch rule has a populated
    /// `coin_gc_id` entry in `target_data`. Enforced at registration per the
    /// price-API symbol-ambiguity decision.
    pub fn has_coin_gc_ids(&self) -> bool {
        if self.watch_type != WatchType::Token {
            return true;
        }
        self.target.iter().all(|t| {
            self.target_data
                .get(t)
                .and_then(|v| v.get("coin_gc_id"))
                .and_then(|v| v.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false)
        })
    }
}

// =============================================================================
// Match data — tagged-variant MatchEntry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    In,
    Out,
}

/// One matched condition. Every variant flattens into the JSON shape the
/// matcher and dispatcher expect on the wire — a tagged union keyed by
/// `condition` rather than one untyped dict, so construction is compile-time
/// checked while still round-tripping through the broker as plain JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum MatchEntry {
    PriceAbove {
        token: String,
        value: f64,
        threshold: f64,
    },
    PriceBelow {
        token: String,
        value: f64,
        threshold: f64,
    },
    PriceChange {
        token: String,
        old_price: f64,
        new_price: f64,
        value: f64,
    },
    PriceChange24h {
        token: String,
        value: f64,
        current_price: f64,
    },
    #[serde(rename = "alert")]
    AlertText {
        token: Option<String>,
        message: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    NativeTransfer {
        direction: TransferDirection,
        wallet: String,
        chain: Chain,
        from: String,
        to: String,
        amount: f64,
        symbol: String,
        balance: f64,
        tx_hash: String,
    },
    TokenTransfer {
        direction: TransferDirection,
        wallet: String,
        chain: Chain,
        from: String,
        to: String,
        amount: f64,
        token_symbol: String,
        contract_address: String,
        tx_hash: String,
    },
    TokenTrade {
        wallet: String,
        chain: Chain,
        side: String,
        token_symbol: String,
        token_amount: f64,
        counter_symbol: String,
        counter_amount: f64,
        dex: String,
        tx_hash: String,
    },
    NftTransfer {
        direction: TransferDirection,
        wallet: String,
        chain: Chain,
        from: String,
        to: String,
        collection: String,
        token_id: String,
        amount: f64,
        tx_hash: String,
    },
    NftTrade {
        wallet: String,
        chain: Chain,
        direction: TransferDirection,
        collection: String,
        token_id: String,
        price_token: String,
        price_amount: f64,
        tx_hash: String,
    },
}

impl MatchEntry {
    /// The `target` this entry is reported against — the token symbol for
    /// token-watch conditions, the wallet address for wallet-watch ones.
    pub fn subject(&self) -> &str {
        match self {
            MatchEntry::PriceAbove { token, .. }
            | MatchEntry::PriceBelow { token, .. }
            | MatchEntry::PriceChange { token, .. }
            | MatchEntry::PriceChange24h { token, .. } => token,
            MatchEntry::AlertText { token, .. } => token.as_deref().unwrap_or(""),
            MatchEntry::NativeTransfer { wallet, .. }
            | MatchEntry::TokenTransfer { wallet, .. }
            | MatchEntry::TokenTrade { wallet, .. }
            | MatchEntry::NftTransfer { wallet, .. }
            | MatchEntry::NftTrade { wallet, .. } => wallet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchData {
    pub matches: Vec<MatchEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: Rule,
    pub match_data: MatchData,
    pub matched_at: DateTime<Utc>,
}

// =============================================================================
// Notification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMetadata {
    pub rule_id: String,
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    #[serde(default = "default_true")]
    pub disable_web_page_preview: bool,
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user: String,
    pub channel: NotifyChannel,
    pub message: String,
    pub metadata: NotificationMetadata,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "default_pending")]
    pub status: NotificationStatus,
}

fn default_pending() -> NotificationStatus {
    NotificationStatus::Pending
}

// =============================================================================
// Wallet snapshot — the WalletTracker::get_wallet_data return shape
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub chain: Chain,
    pub balance: f64,
    pub balance_change: f64,
    pub transactions: Vec<MatchEntry>,
    pub last_updated: DateTime<Utc>,
}

// =============================================================================
// Topics & keys — every broker channel name and TTL'd key shape in one place
// =============================================================================

pub mod topics {
    use super::WatchType;

    pub fn register_rule(watch_type: WatchType) -> String {
        format!("{}_watch:register_rule", watch_type.as_str())
    }

    pub fn deactivate_rule(watch_type: WatchType) -> String {
        format!("{}_watch:deactivate_rule", watch_type.as_str())
    }

    pub fn rule_activated(watch_type: WatchType) -> String {
        format!("{}_watch:rule_activated", watch_type.as_str())
    }

    pub fn rule_matched(watch_type: WatchType) -> String {
        format!("{}_watch:rule_matched", watch_type.as_str())
    }

    pub fn send_notify(watch_type: WatchType) -> String {
        format!("{}_watch:send_notify", watch_type.as_str())
    }

    pub fn notify_sent(watch_type: WatchType) -> String {
        format!("{}_watch:notify_sent", watch_type.as_str())
    }

    pub fn notify_failed(watch_type: WatchType) -> String {
        format!("{}_watch:notify_failed", watch_type.as_str())
    }

    pub fn notify_duplicate(watch_type: WatchType) -> String {
        format!("{}_watch:notify_duplicate", watch_type.as_str())
    }

    /// `watch:active:<type>:<target>` — hash of `rule_id -> rule json`.
    pub fn active_watch_key(watch_type: WatchType, target: &str) -> String {
        format!("watch:active:{}:{}", watch_type.as_str(), target)
    }

    /// `notify:recent:<channel>:<user>` — dispatcher-level dedup set.
    pub fn notify_recent_key(channel: &str, user: &str) -> String {
        format!("notify:recent:{}:{}", channel, user)
    }

    /// `notify:status:<channel>:<user>:<hash>` — per-message delivery status.
    pub fn notify_status_key(channel: &str, user: &str, message_hash: &str) -> String {
        format!("notify:status:{}:{}:{}", channel, user, message_hash)
    }

    /// `rate_limit:<channel>:<user>` — sliding-window rate-limit hash.
    pub fn rate_limit_key(channel: &str, user: &str) -> String {
        format!("rate_limit:{}:{}", channel, user)
    }

    /// `notify:last:<type>:<rule_id>` — matcher-level dedup key.
    pub fn notify_last_key(watch_type: WatchType, rule_id: &str) -> String {
        format!("notify:last:{}:{}", watch_type.as_str(), rule_id)
    }

    pub const WORKER_STATUS_KEY: &str = "worker:status";
}

/// Generate a fresh rule id in the same shape the original agent produces
/// (a plain UUID v4 string) for use by tests building synthetic rules.
pub fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&WatchType::Token).unwrap(), "\"token\"");
        assert_eq!(serde_json::to_string(&WatchType::Airdrop).unwrap(), "\"airdrop\"");
    }

    #[test]
    fn topics_match_expected_shape() {
        assert_eq!(topics::register_rule(WatchType::Token), "token_watch:register_rule");
        assert_eq!(topics::rule_matched(WatchType::Wallet), "wallet_watch:rule_matched");
        assert_eq!(topics::send_notify(WatchType::Airdrop), "airdrop_watch:send_notify");
        assert_eq!(topics::active_watch_key(WatchType::Token, "BTC"), "watch:active:token:BTC");
        assert_eq!(topics::notify_recent_key("telegram", "u1"), "notify:recent:telegram:u1");
        assert_eq!(topics::rate_limit_key("telegram", "u1"), "rate_limit:telegram:u1");
        assert_eq!(topics::notify_last_key(WatchType::Token, "r1"), "notify:last:token:r1");
    }

    #[test]
    fn match_entry_round_trips_price_above() {
        let entry = MatchEntry::PriceAbove {
            token: "BTC".to_string(),
            value: 65000.0,
            threshold: 60000.0,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["condition"], "price_above");
        let back: MatchEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.subject(), "BTC");
    }

    #[test]
    fn rule_requires_coin_gc_id_for_token_watch() {
        let mut rule = Rule {
            rule_id: new_rule_id(),
            user_id: "u1".to_string(),
            watch_type: WatchType::Token,
            target: vec!["BTC".to_string()],
            condition: None,
            notify_channel: NotifyChannel::Telegram,
            notify_id: "123".to_string(),
            target_data: HashMap::new(),
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: "active".to_string(),
            active: true,
        };
        assert!(!rule.has_coin_gc_ids());

        rule.target_data.insert(
            "BTC".to_string(),
            serde_json::json!({ "coin_gc_id": "bitcoin" }),
        );
        assert!(rule.has_coin_gc_ids());
    }

    #[test]
    fn wallet_watch_rule_does_not_require_coin_gc_id() {
        let rule = Rule {
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
        };
        assert!(rule.has_coin_gc_ids());
    }
}
