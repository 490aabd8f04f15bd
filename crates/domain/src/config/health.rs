use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill health configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thresholds for the healthy → degraded → unavailable state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a skill is marked degraded.
    #[serde(default = "d_degraded_threshold")]
    pub degraded_threshold: u32,
    /// Consecutive failures before a skill is marked unavailable.
    #[serde(default = "d_unavailable_threshold")]
    pub unavailable_threshold: u32,
    /// How long after the last failure a recovery probe is permitted.
    #[serde(default = "d_recovery_window_ms")]
    pub recovery_window_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: d_degraded_threshold(),
            unavailable_threshold: d_unavailable_threshold(),
            recovery_window_ms: d_recovery_window_ms(),
        }
    }
}

fn d_degraded_threshold() -> u32 {
    3
}

fn d_unavailable_threshold() -> u32 {
    10
}

fn d_recovery_window_ms() -> u64 {
    60_000
}
