// =============================================================================
// Notification Dispatcher — dedup, rate-limit, idempotent send-with-retry
// =============================================================================
//
// The Rust analogue of the reference implementation's `NotifyDispatcher`.
// Subscribes to `<t>_watch:send_notify` for all three watch types and runs
// every notification through, in order: cross-event dedup, a per-channel
// sliding-window rate limit, an idempotency check, then a bounded retry
// loop against the channel adapter. Terminal outcomes are published on
// `<t>_watch:notify_sent` / `_failed` / `_duplicate`.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::models::{topics, Notification, NotifyChannel, WatchType};
use crate::shutdown::Shutdown;

const RATE_LIMIT_WINDOW_SECS: i64 = 60;

pub struct NotificationDispatcher {
    ctx: Arc<Context>,
}

impl NotificationDispatcher {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn start(self: &Arc<Self>, shutdown: Shutdown) {
        for watch_type in WatchType::all() {
            let dispatcher = self.clone();
            let topic = topics::send_notify(watch_type);
            self.ctx.broker.subscribe(
                topic,
                Arc::new(move |_channel, payload| {
                    let dispatcher = dispatcher.clone();
                    Box::pin(async move {
                        dispatcher.process_notification(watch_type, payload).await;
                    })
                }),
                shutdown.clone(),
            );
        }
    }

    #[instrument(skip(self, payload), fields(%watch_type))]
    async fn process_notification(&self, watch_type: WatchType, payload: serde_json::Value) {
        let notification: Notification = match serde_json::from_value(payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "dropping undecodable send_notify payload");
                return;
            }
        };

        let rule_id = notification.metadata.rule_id.clone();
        let user_id = notification.metadata.user_id.clone();
        let channel = notification.channel.as_str();

        if self.is_duplicate(&notification).await {
            info!(%rule_id, "duplicate notification suppressed");
            self.publish_status(
                topics::notify_duplicate(watch_type),
                DuplicateStatus {
                    rule_id,
                    user_id,
                    channel: channel.to_string(),
                    message: notification.message.chars().take(100).collect(),
                },
            )
            .await;
            return;
        }

        if !self.check_rate_limit(&notification).await {
            warn!(%rule_id, user = %notification.user, channel, "rate limit exceeded");
            self.publish_status(
                topics::notify_failed(watch_type),
                FailedStatus { rule_id, user_id, channel: channel.to_string(), error: "Rate limit exceeded".to_string() },
            )
            .await;
            return;
        }

        let status_key = topics::notify_status_key(channel, &notification.user, &message_digest(&notification.message));
        let max_retries = self.ctx.config.notification.max_retries.max(1);
        let retry_delay = std::time::Duration::from_secs(self.ctx.config.notification.dispatcher_retry_delay_secs);
        let dedup_window = self.ctx.config.notification.dispatcher_dedup_window_secs.max(0) as u64;

        for attempt in 1..=max_retries {
            match self.ctx.broker.get(&status_key).await {
                Ok(Some(status)) if status == "sent" => {
                    info!(%rule_id, "notification already marked sent — suppressing resend");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to read idempotency status — proceeding"),
            }

            match self.send(&notification).await {
                Ok(true) => {
                    if let Err(e) = self.ctx.broker.set(&status_key, "sent", Some(dedup_window)).await {
                        warn!(error = %e, "failed to persist sent status");
                    }
                    self.publish_status(
                        topics::notify_sent(watch_type),
                        SentStatus { rule_id, user_id, channel: channel.to_string(), success: true, attempt },
                    )
                    .await;
                    return;
                }
                Ok(false) => warn!(%rule_id, attempt, "notification send returned failure"),
                Err(e) => warn!(%rule_id, attempt, error = %e, "notification send errored"),
            }

            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }

        warn!(%rule_id, max_retries, "notification failed after exhausting retries");
        self.publish_status(
            topics::notify_failed(watch_type),
            FailedStatus {
                rule_id,
                user_id,
                channel: channel.to_string(),
                error: format!("Failed after {max_retries} attempts"),
            },
        )
        .await;
    }

    /// `notify:recent:<channel>:<user>` set dedup, per §4.9 step 1.
    async fn is_duplicate(&self, notification: &Notification) -> bool {
        let channel = notification.channel.as_str();
        let recent_key = topics::notify_recent_key(channel, &notification.user);
        let member = format!("{channel}:{}:{}", notification.user, notification.message);

        match self.ctx.broker.sismember(&recent_key, &member).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "failed to check recent-notification set — allowing send");
                return false;
            }
        }

        if let Err(e) = self.ctx.broker.sadd(&recent_key, &member).await {
            warn!(error = %e, "failed to record recent notification");
        }
        let window = self.ctx.config.notification.dispatcher_dedup_window_secs;
        if let Err(e) = self.ctx.broker.expire(&recent_key, window).await {
            warn!(error = %e, "failed to set dedup window TTL");
        }

        let max_messages = self.ctx.config.notification.dispatcher_dedup_max_messages;
        match self.ctx.broker.scard(&recent_key).await {
            Ok(size) if size > max_messages as i64 => {
                for _ in 0..(size - max_messages as i64) {
                    if let Err(e) = self.ctx.broker.spop(&recent_key).await {
                        warn!(error = %e, "failed to trim dedup set");
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to check dedup set size"),
        }

        false
    }

    /// `rate_limit:<channel>:<user>` sliding-window counter, per §4.9 step 2.
    async fn check_rate_limit(&self, notification: &Notification) -> bool {
        let channel = notification.channel.as_str();
        let key = topics::rate_limit_key(channel, &notification.user);
        let now = unix_now();
        let quota = self.ctx.config.rate_limit_quota(channel) as usize;

        let timestamps = match self.ctx.broker.hgetall(&key).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to read rate-limit window — denying send");
                return false;
            }
        };

        let mut live_count = 0usize;
        for (field, value) in &timestamps {
            match value.parse::<i64>() {
                Ok(ts) if ts > now - RATE_LIMIT_WINDOW_SECS => live_count += 1,
                _ => {
                    if let Err(e) = self.ctx.broker.hdel(&key, field).await {
                        warn!(error = %e, "failed to purge stale rate-limit entry");
                    }
                }
            }
        }

        if live_count >= quota {
            return false;
        }

        if let Err(e) = self.ctx.broker.hset(&key, &now.to_string(), &now.to_string()).await {
            warn!(error = %e, "failed to record rate-limit timestamp");
        }
        if let Err(e) = self.ctx.broker.expire(&key, RATE_LIMIT_WINDOW_SECS * 2).await {
            warn!(error = %e, "failed to set rate-limit TTL");
        }

        true
    }

    async fn send(&self, notification: &Notification) -> anyhow::Result<bool> {
        match notification.channel {
            NotifyChannel::Telegram => self.send_telegram(notification).await,
            NotifyChannel::Web => {
                info!(user = %notification.user, message = %notification.message, "[web] notification logged (adapter out of scope)");
                Ok(true)
            }
            NotifyChannel::Discord => {
                info!(user = %notification.user, message = %notification.message, "[discord] notification logged (adapter out of scope)");
                Ok(true)
            }
        }
    }

    async fn send_telegram(&self, notification: &Notification) -> anyhow::Result<bool> {
        let token = &self.ctx.config.notification.telegram_bot_token;
        if token.is_empty() {
            warn!("telegram bot token not configured");
            return Ok(false);
        }

        let url = format!("{}/bot{}/sendMessage", self.ctx.config.telegram_api_base, token);
        let body = serde_json::json!({
            "chat_id": notification.user,
            "text": notification.message,
            "parse_mode": notification.metadata.parse_mode,
            "disable_web_page_preview": notification.metadata.disable_web_page_preview,
        });

        let resp = self.ctx.http.post(&url).json(&body).send().await?;
        if resp.status().as_u16() != 200 {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = %text, "telegram API returned non-200");
            return Ok(false);
        }

        let decoded: serde_json::Value = resp.json().await?;
        Ok(decoded.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn publish_status<T: Serialize>(&self, topic: String, payload: T) {
        if let Err(e) = self.ctx.broker.publish(&topic, &payload).await {
            warn!(topic, error = %e, "failed to publish dispatcher status event");
        }
    }
}

#[derive(Serialize)]
struct DuplicateStatus {
    rule_id: String,
    user_id: String,
    channel: String,
    message: String,
}

#[derive(Serialize)]
struct FailedStatus {
    rule_id: String,
    user_id: String,
    channel: String,
    error: String,
}

#[derive(Serialize)]
struct SentStatus {
    rule_id: String,
    user_id: String,
    channel: String,
    success: bool,
    attempt: u32,
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Fast non-cryptographic digest of a message body, used only as an
/// idempotency cache-key component — mirrors the reference implementation's
/// use of Python's built-in `hash()` for the same purpose.
fn message_digest(message: &str) -> String {
    let mut hasher = DefaultHasher::new();
    message.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_digest_is_stable_for_same_input() {
        assert_eq!(message_digest("hello"), message_digest("hello"));
        assert_ne!(message_digest("hello"), message_digest("world"));
    }
}
