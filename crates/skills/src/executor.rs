//! Resilient execution: a timeout plus classified retries for any
//! fallible async operation.
//!
//! Only transient failures (connection errors, HTTP 429/5xx, timeouts)
//! are retried, with an expanding delay. Everything else aborts on the
//! first attempt.

use std::future::Future;
use std::time::Duration;

use coda_domain::{Error, Result};

const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(4);

/// Timeout and retry budget for one operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    exp.min(MAX_DELAY)
}

/// Run `f`, racing each attempt against the policy timeout and retrying
/// transient failures up to `policy.retries` times.
pub async fn run_resilient<T, F, Fut>(op: &str, policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let error = match tokio::time::timeout(policy.timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout(format!("{op} exceeded {:?}", policy.timeout)),
        };

        if !error.is_transient() || attempt >= policy.retries {
            return Err(error);
        }

        let delay = backoff_delay(attempt);
        tracing::warn!(
            op,
            error = %error,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
