// =============================================================================
// Retry — shared exponential-backoff helper for every external call
// =============================================================================
//
// One helper used by the price, alerts, EVM RPC, and Solana RPC clients so
// the backoff policy (2s -> 4s -> 8s, capped at 10s, 3 attempts) lives in one
// place instead of being re-implemented per client, matching the
// `tenacity`-decorated `call_api` it is ported from.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Outcome of a retried call: either it eventually succeeded, or every
/// attempt was exhausted. Kept distinct from a plain `Result` so callers
/// can log "gave up after N attempts" without re-deriving N.
pub enum RetryOutcome<T> {
    Success(T),
    Exhausted { attempts: u32, last_error: anyhow::Error },
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { attempts, last_error } => {
                Err(last_error.context(format!("exhausted {attempts} retry attempts")))
            }
        }
    }
}

/// Retry policy: a fixed number of attempts with exponential backoff between
/// them, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1 << attempt.min(8));
        scaled.min(self.max_delay)
    }

    /// Run `op` up to `max_attempts` times. `op` returns `Ok` on success and
    /// an error classified as retryable by `should_retry`; a non-retryable
    /// error short-circuits immediately (matches the original's distinction
    /// between network/timeout errors, which tenacity retries, and HTTP
    /// error responses, which it returns as-is).
    pub async fn run<T, F, Fut>(&self, mut should_retry: impl FnMut(&anyhow::Error) -> bool, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(err) => {
                    attempt += 1;
                    let retryable = should_retry(&err);
                    if !retryable || attempt >= self.max_attempts {
                        return RetryOutcome::Exhausted {
                            attempts: attempt,
                            last_error: err,
                        };
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 2s base delay, 10s cap — matches §6's "retry up to 3 times
    /// with exponential backoff (2s -> 10s)".
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(10))
    }
}

/// True for the class of errors that represent a transient network failure
/// (connection refused, timed out, DNS) rather than a well-formed non-2xx
/// HTTP response — mirrors the original's `retry_if_exception_type((
/// aiohttp.ClientError, asyncio.TimeoutError))`.
pub fn is_transient_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let outcome = policy
            .run(|_| true, || async { Ok::<_, anyhow::Error>(42) })
            .await;
        assert!(matches!(outcome, RetryOutcome::Success(42)));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome = policy
            .run(
                |_| true,
                move || {
                    let c = c.clone();
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            anyhow::bail!("transient");
                        }
                        Ok(99)
                    }
                },
            )
            .await;
        assert!(matches!(outcome, RetryOutcome::Success(99)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        let outcome = policy
            .run(|_| true, || async { Err::<(), _>(anyhow::anyhow!("down")) })
            .await;
        match outcome {
            RetryOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            _ => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits_on_first_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));
        let outcome = policy
            .run(|_| false, || async { Err::<(), _>(anyhow::anyhow!("http 400")) })
            .await;
        match outcome {
            RetryOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
            _ => panic!("expected exhaustion"),
        }
    }
}
