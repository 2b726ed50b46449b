// =============================================================================
// Broker Client — Redis-backed pub/sub + ephemeral key-value store
// =============================================================================
//
// Wraps a `redis::aio::ConnectionManager`, which multiplexes and
// auto-reconnects a single connection across every caller — this satisfies
// the "broker connection is shared across subscribers" resource-model
// requirement without a connection pool of our own. `subscribe` is the one
// operation that needs a dedicated connection (pub/sub puts a Redis
// connection into a different protocol mode), so it opens its own
// `PubSub` connection per channel inside a spawned task.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::shutdown::Shutdown;

/// A decoded pub/sub message handler. Boxed so `subscribe` can accept either
/// a closure or a trait object uniformly.
pub type MessageHandler =
    Arc<dyn Fn(String, serde_json::Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Errors this client surfaces instead of silently treating "could not ask"
/// as "not found" — callers of `get`/`hget`/… must be able to tell a cache
/// miss from a broker outage.
#[derive(Debug)]
pub enum BrokerError {
    Unavailable(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Unavailable(msg) => write!(f, "broker unavailable: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

fn classify(err: redis::RedisError) -> anyhow::Error {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        anyhow::Error::new(BrokerError::Unavailable(err.to_string()))
    } else {
        anyhow::Error::new(err)
    }
}

/// Redis-backed broker client. Clone is cheap — `ConnectionManager` is itself
/// an `Arc`-like handle.
#[derive(Clone)]
pub struct BrokerClient {
    conn: ConnectionManager,
    redis_url: String,
}

impl BrokerClient {
    #[instrument(skip(redis_url), name = "broker::connect")]
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to establish redis connection manager")?;

        debug!("broker connected");
        Ok(Self {
            conn,
            redis_url: redis_url.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // String key-value
    // -------------------------------------------------------------------------

    pub async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(secs) => conn
                .set_ex::<_, _, ()>(key, value, secs)
                .await
                .map_err(classify)?,
            None => conn.set::<_, _, ()>(key, value).await.map_err(classify)?,
        }
        Ok(())
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) -> Result<()> {
        let encoded = serde_json::to_string(value).context("failed to encode value as json")?;
        self.set(key, &encoded, ttl).await
    }

    /// Returns `Ok(None)` on a genuine cache miss, `Err` when the broker
    /// could not be reached at all.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(classify)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("failed to decode json for key {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(classify)?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_secs).await.map_err(classify)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Hash
    // -------------------------------------------------------------------------

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await.map_err(classify)?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(classify)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(classify)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await.map_err(classify)?;
        Ok(())
    }

    pub async fn hlen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.hlen(key).await.map_err(classify)
    }

    // -------------------------------------------------------------------------
    // Set
    // -------------------------------------------------------------------------

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(classify)?;
        Ok(())
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(key, member).await.map_err(classify)
    }

    pub async fn scard(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(classify)
    }

    /// Pop and return an arbitrary member, or `None` if the set is empty.
    pub async fn spop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.spop(key).await.map_err(classify)
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(classify)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // List
    // -------------------------------------------------------------------------

    pub async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value).await.map_err(classify)?;
        Ok(())
    }

    pub async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value).await.map_err(classify)?;
        Ok(())
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.rpop(key, None).await.map_err(classify)
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start, stop).await.map_err(classify)
    }

    pub async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(classify)
    }

    // -------------------------------------------------------------------------
    // Pub/sub
    // -------------------------------------------------------------------------

    #[instrument(skip(self, payload), fields(channel = %channel))]
    pub async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let encoded = serde_json::to_string(payload).context("failed to encode publish payload")?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, encoded).await.map_err(classify)?;
        Ok(())
    }

    /// Spawn a dedicated listener task subscribed to `channel`. Incoming
    /// payloads are JSON-decoded and handed to `handler`; decode failures are
    /// logged at `warn` and skipped, never propagated. If the connection is
    /// lost or never establishes, the task itself resubscribes with a 5 s
    /// backoff (the "subscription maintainer" of §4.4) until `shutdown`
    /// fires, so callers never need to re-issue `subscribe`.
    pub fn subscribe(&self, channel: String, handler: MessageHandler, mut shutdown: Shutdown) {
        let redis_url = self.redis_url.clone();
        const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

        tokio::spawn(async move {
            loop {
                if shutdown.is_shutdown() {
                    return;
                }

                if let Err(e) =
                    Self::run_subscription(&redis_url, &channel, &handler, &mut shutdown).await
                {
                    warn!(channel = %channel, error = %e, "subscription dropped — reconnecting in 5s");
                }

                if shutdown.is_shutdown() {
                    return;
                }
                tokio::select! {
                    _ = shutdown.signalled() => return,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        });
    }

    /// Run one subscription attempt to completion: connect, subscribe,
    /// stream messages until the connection ends or shutdown fires.
    async fn run_subscription(
        redis_url: &str,
        channel: &str,
        handler: &MessageHandler,
        shutdown: &mut Shutdown,
    ) -> Result<()> {
        let client = redis::Client::open(redis_url).context("failed to open redis client")?;
        let conn = client
            .get_async_connection()
            .await
            .context("failed to open pubsub connection")?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.context("failed to subscribe")?;

        debug!(channel, "subscription established");
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown.signalled() => {
                    debug!(channel, "subscription loop shutting down");
                    return Ok(());
                }
                maybe_msg = stream.next() => {
                    let Some(msg) = maybe_msg else {
                        anyhow::bail!("pubsub stream ended");
                    };
                    let raw: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(channel, error = %e, "failed to read message payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<serde_json::Value>(&raw) {
                        Ok(decoded) => (handler)(channel.to_string(), decoded).await,
                        Err(e) => {
                            warn!(channel, error = %e, "dropping undecodable message");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("redis_url", &"<redacted>")
            .finish()
    }
}
