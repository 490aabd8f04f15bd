use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Approximate cap on the event stream (MAXLEN ~).
    #[serde(default = "d_event_stream_max_len")]
    pub event_stream_max_len: u64,
    /// TTL of idempotency receipts, seconds.
    #[serde(default = "d_idempotency_key_ttl")]
    pub idempotency_key_ttl: u64,
    /// Blocking-read timeout for the live phase, milliseconds.
    #[serde(default = "d_block_ms")]
    pub block_ms: u64,
    /// Consumer group shared by every process of this deployment.
    #[serde(default = "d_consumer_group")]
    pub consumer_group: String,
    /// Retries per (message, handler) before dead-lettering.
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            event_stream_max_len: d_event_stream_max_len(),
            idempotency_key_ttl: d_idempotency_key_ttl(),
            block_ms: d_block_ms(),
            consumer_group: d_consumer_group(),
            max_retries: d_max_retries(),
        }
    }
}

fn d_event_stream_max_len() -> u64 {
    10_000
}

fn d_idempotency_key_ttl() -> u64 {
    86_400
}

fn d_block_ms() -> u64 {
    5_000
}

fn d_consumer_group() -> String {
    "coda".into()
}

fn d_max_retries() -> u32 {
    3
}
