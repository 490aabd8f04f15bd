use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::Severity;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alert routing configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertsConfig {
    /// Routing rules keyed by exact event type.
    #[serde(default)]
    pub rules: HashMap<String, AlertRuleConfig>,
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
}

/// A routing rule for one event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    /// Minimum severity to route; lower-severity events are suppressed.
    #[serde(default)]
    pub severity: Severity,
    /// Sink names this rule delivers to.
    pub channels: Vec<String>,
    /// Whether the rule may be suppressed during quiet hours.
    #[serde(default = "d_true")]
    pub quiet_hours: bool,
    /// Dedup window per (event type, source skill), seconds. 0 disables.
    #[serde(default)]
    pub cooldown: u64,
}

/// Global quiet-hours window, evaluated in the configured timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Window start, `HH:MM` local time.
    #[serde(default = "d_quiet_start")]
    pub start: String,
    /// Window end, `HH:MM` local time. May be earlier than `start`
    /// (window crosses midnight).
    #[serde(default = "d_quiet_end")]
    pub end: String,
    #[serde(default = "d_timezone")]
    pub timezone: String,
    /// Severities that bypass quiet-hours suppression.
    #[serde(default = "d_override_severities")]
    pub override_severities: Vec<Severity>,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: d_quiet_start(),
            end: d_quiet_end(),
            timezone: d_timezone(),
            override_severities: d_override_severities(),
        }
    }
}

fn d_true() -> bool {
    true
}

fn d_quiet_start() -> String {
    "22:00".into()
}

fn d_quiet_end() -> String {
    "08:00".into()
}

fn d_timezone() -> String {
    "UTC".into()
}

fn d_override_severities() -> Vec<Severity> {
    vec![Severity::High]
}

/// Parse a `HH:MM` clock string into minutes since midnight.
pub fn parse_clock(value: &str) -> Option<u32> {
    let (h, m) = value.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}
