//! Backend traits: the stream log and the key/value namespaces.

use std::collections::HashMap;

use async_trait::async_trait;

use coda_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry read from a stream, with the id needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Convenience accessor for a single field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// An append-only, ordered log with consumer groups.
///
/// A message delivered to a consumer stays in that consumer's pending list
/// until acknowledged; unacknowledged messages are re-delivered by
/// [`read_pending`](StreamBackend::read_pending) when the consumer
/// restarts.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append an entry, trimming the stream to roughly `maxlen` when set.
    /// Returns the assigned entry id.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String>;

    /// Create the consumer group if it does not exist. Starting position
    /// is the beginning of the stream, so entries published before the
    /// group existed are still delivered.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read entries already delivered to this consumer but not yet
    /// acknowledged, oldest first.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Read up to `count` new entries, blocking up to `block_ms` when the
    /// stream is idle. Delivered entries become pending for `consumer`.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the group's pending lists.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Current stream length.
    async fn len(&self, stream: &str) -> Result<u64>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key/value
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of recording one hit against a sliding window.
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    /// Hits inside the window, including the one just recorded.
    pub count: u32,
    /// Timestamp of the oldest hit still in the window, milliseconds.
    pub oldest_ms: Option<i64>,
}

/// TTL keys and the sliding-window counter used by idempotency receipts,
/// cooldowns, and rate limits. All writes are last-writer-wins.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Batched variant of [`set_ex`](KvBackend::set_ex); one round-trip on
    /// backends that support pipelining.
    async fn set_many_ex(&self, pairs: &[(String, String)], ttl_secs: u64) -> Result<()>;

    /// Set only if absent. Returns `true` when this call claimed the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Record a hit at `now_ms` against the window ending at `now_ms`,
    /// prune hits older than `window_ms`, and return the sample.
    async fn sliding_window(&self, key: &str, now_ms: i64, window_ms: i64)
        -> Result<WindowSample>;
}
