use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch tick interval, seconds.
    #[serde(default = "d_tick_seconds")]
    pub tick_seconds: u64,
    /// Timezone cron expressions are evaluated in.
    #[serde(default = "d_timezone")]
    pub timezone: String,
    /// Per-task overrides applied at registration, keyed by full task name.
    #[serde(default)]
    pub tasks: HashMap<String, TaskOverride>,
}

/// Overrides a registered task's schedule or enablement.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskOverride {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: d_tick_seconds(),
            timezone: d_timezone(),
            tasks: HashMap::new(),
        }
    }
}

fn d_tick_seconds() -> u64 {
    60
}

fn d_timezone() -> String {
    "UTC".into()
}
