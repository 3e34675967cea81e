use crate::gemini::GenAiError;
use std::future::Future;
use std::time::Duration;

/// Backoff tuning for one remote operation. Call sites get their own
/// policy from config instead of sharing a hardcoded one.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self { retries, base_delay }
    }
}

/// Run `op`, retrying rate-limit/overload failures with strictly doubling
/// delays (D, 2D, 4D, ...). Total attempts = 1 + `policy.retries`. Any
/// non-retryable error, or a retryable one past the budget, propagates
/// unchanged. Only the calling task sleeps during backoff.
pub async fn call_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, GenAiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenAiError>>,
{
    let mut remaining = policy.retries;
    let mut delay = policy.base_delay;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && remaining > 0 => {
                let attempt = policy.retries - remaining + 1;
                log::warn!(
                    "transient API error, retry {}/{} in {:?}: {}",
                    attempt,
                    policy.retries,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                remaining -= 1;
            }
            Err(e) => return Err(e),
        }
    }
}
