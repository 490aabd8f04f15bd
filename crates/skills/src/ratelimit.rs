//! Sliding-window rate limiter over the shared store.
//!
//! Counters live in the store's `ratelimit:<scope>:<identifier>`
//! namespace, so the limiter is distributed whenever a shared backend is
//! configured and in-process otherwise. Exceeding a limit is an ordinary
//! decision with a retry-after hint, never an error.

use std::sync::Arc;

use chrono::Utc;

use coda_domain::Result;
use coda_store::KvBackend;

/// Outcome of one admission check. The hit is recorded either way.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Hits inside the window, including this one.
    pub current: u32,
    /// When denied: how long until the oldest hit leaves the window.
    pub retry_after_ms: Option<u64>,
}

pub struct RateLimiter {
    kv: Arc<dyn KvBackend>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    /// Record a hit for `(scope, identifier)` and decide whether it fits
    /// inside `max_requests` per `window_secs`.
    pub async fn check(
        &self,
        scope: &str,
        identifier: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> Result<RateDecision> {
        let key = format!("ratelimit:{scope}:{identifier}");
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = (window_secs * 1000) as i64;

        let sample = self.kv.sliding_window(&key, now_ms, window_ms).await?;
        if sample.count <= max_requests {
            return Ok(RateDecision {
                allowed: true,
                current: sample.count,
                retry_after_ms: None,
            });
        }

        let retry_after_ms = sample
            .oldest_ms
            .map(|oldest| (oldest + window_ms - now_ms).max(0) as u64);
        Ok(RateDecision {
            allowed: false,
            current: sample.count,
            retry_after_ms,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
