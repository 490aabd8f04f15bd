use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared store configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which backend the stream log and key/value namespaces live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    /// In-process backend. No durability across restarts, but full
    /// consumer-group semantics within the process.
    #[default]
    Memory,
    /// Redis-backed: streams, consumer groups, and TTL keys are shared by
    /// every process using the same consumer group name.
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,
    /// Connection URL, required when `backend = "redis"`.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key of the main event stream.
    #[serde(default = "d_event_stream")]
    pub event_stream: String,
    /// Key of the dead-letter stream.
    #[serde(default = "d_dead_letter_stream")]
    pub dead_letter_stream: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            redis_url: None,
            event_stream: d_event_stream(),
            dead_letter_stream: d_dead_letter_stream(),
        }
    }
}

fn d_event_stream() -> String {
    "coda:events".into()
}

fn d_dead_letter_stream() -> String {
    "coda:events:dead".into()
}
