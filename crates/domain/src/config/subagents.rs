use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagent configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentsConfig {
    #[serde(default = "d_enabled")]
    pub enabled: bool,
    /// Default wall-clock bound for async runs, minutes.
    #[serde(default = "d_default_timeout_minutes")]
    pub default_timeout_minutes: u64,
    /// Hard cap a caller-requested timeout is clamped to, minutes.
    #[serde(default = "d_max_timeout_minutes")]
    pub max_timeout_minutes: u64,
    /// Wall-clock bound for sync delegation, seconds.
    #[serde(default = "d_sync_timeout_seconds")]
    pub sync_timeout_seconds: u64,
    #[serde(default = "d_max_concurrent_per_user")]
    pub max_concurrent_per_user: usize,
    #[serde(default = "d_max_concurrent_global")]
    pub max_concurrent_global: usize,
    /// How long terminal runs stay in memory before moving to the archive.
    #[serde(default = "d_archive_ttl_minutes")]
    pub archive_ttl_minutes: u64,
    /// Bound on tool-agent loop iterations.
    #[serde(default = "d_max_tool_calls_per_run")]
    pub max_tool_calls_per_run: u32,
    /// Token budget applied when the caller does not request one.
    #[serde(default = "d_default_token_budget")]
    pub default_token_budget: u64,
    /// Requested budgets are clamped to this ceiling.
    #[serde(default = "d_max_token_budget")]
    pub max_token_budget: u64,
    #[serde(default)]
    pub spawn_rate_limit: SpawnRateLimit,
    /// Interval of the archival sweep, seconds.
    #[serde(default = "d_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Named specialist presets resolvable by `specialist_spawn`.
    #[serde(default)]
    pub specialists: HashMap<String, SpecialistPreset>,
}

/// Per-user spawn admission window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRateLimit {
    #[serde(default = "d_spawn_max_requests")]
    pub max_requests: u32,
    #[serde(default = "d_spawn_window_seconds")]
    pub window_seconds: u64,
}

/// A named preset: system prompt, a scoped tool set, and a token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistPreset {
    pub system_prompt: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub token_budget: Option<u64>,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            enabled: d_enabled(),
            default_timeout_minutes: d_default_timeout_minutes(),
            max_timeout_minutes: d_max_timeout_minutes(),
            sync_timeout_seconds: d_sync_timeout_seconds(),
            max_concurrent_per_user: d_max_concurrent_per_user(),
            max_concurrent_global: d_max_concurrent_global(),
            archive_ttl_minutes: d_archive_ttl_minutes(),
            max_tool_calls_per_run: d_max_tool_calls_per_run(),
            default_token_budget: d_default_token_budget(),
            max_token_budget: d_max_token_budget(),
            spawn_rate_limit: SpawnRateLimit::default(),
            cleanup_interval_seconds: d_cleanup_interval_seconds(),
            specialists: HashMap::new(),
        }
    }
}

impl Default for SpawnRateLimit {
    fn default() -> Self {
        Self {
            max_requests: d_spawn_max_requests(),
            window_seconds: d_spawn_window_seconds(),
        }
    }
}

fn d_enabled() -> bool {
    true
}

fn d_default_timeout_minutes() -> u64 {
    10
}

fn d_max_timeout_minutes() -> u64 {
    30
}

fn d_sync_timeout_seconds() -> u64 {
    120
}

fn d_max_concurrent_per_user() -> usize {
    2
}

fn d_max_concurrent_global() -> usize {
    8
}

fn d_archive_ttl_minutes() -> u64 {
    60
}

fn d_max_tool_calls_per_run() -> u32 {
    25
}

fn d_default_token_budget() -> u64 {
    50_000
}

fn d_max_token_budget() -> u64 {
    200_000
}

fn d_spawn_max_requests() -> u32 {
    10
}

fn d_spawn_window_seconds() -> u64 {
    600
}

fn d_cleanup_interval_seconds() -> u64 {
    60
}
