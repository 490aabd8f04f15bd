mod alerts;
mod bus;
mod health;
mod scheduler;
mod store;
mod subagents;

pub use alerts::*;
pub use bus::*;
pub use health::*;
pub use scheduler::*;
pub use store::*;
pub use subagents::*;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for persisted tables (JSONL files).
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub subagents: SubagentsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            store: StoreConfig::default(),
            bus: BusConfig::default(),
            health: HealthConfig::default(),
            subagents: SubagentsConfig::default(),
            alerts: AlertsConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

fn err(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError {
        severity: ConfigSeverity::Error,
        field: field.into(),
        message: message.into(),
    }
}

fn warn(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError {
        severity: ConfigSeverity::Warning,
        field: field.into(),
        message: message.into(),
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        // ── Store ───────────────────────────────────────────────────
        if self.store.event_stream.is_empty() {
            issues.push(err("store.event_stream", "stream key must not be empty"));
        }
        if self.store.dead_letter_stream.is_empty() {
            issues.push(err(
                "store.dead_letter_stream",
                "stream key must not be empty",
            ));
        }
        if self.store.backend == StoreBackendKind::Redis {
            match &self.store.redis_url {
                None => issues.push(err(
                    "store.redis_url",
                    "redis backend requires a connection URL",
                )),
                Some(url) if !url.starts_with("redis://") && !url.starts_with("rediss://") => {
                    issues.push(err(
                        "store.redis_url",
                        format!("must start with redis:// or rediss:// (got \"{url}\")"),
                    ));
                }
                _ => {}
            }
        }

        // ── Bus ─────────────────────────────────────────────────────
        if self.bus.consumer_group.is_empty() {
            issues.push(err("bus.consumer_group", "group name must not be empty"));
        }
        if self.bus.max_retries == 0 {
            issues.push(err("bus.max_retries", "must be at least 1"));
        }
        if self.bus.event_stream_max_len == 0 {
            issues.push(err("bus.event_stream_max_len", "must be greater than 0"));
        }
        if self.bus.block_ms == 0 {
            issues.push(warn(
                "bus.block_ms",
                "0 turns the live phase into a busy loop",
            ));
        }

        // ── Health ──────────────────────────────────────────────────
        if self.health.degraded_threshold == 0 || self.health.unavailable_threshold == 0 {
            issues.push(err("health", "thresholds must be greater than 0"));
        } else if self.health.degraded_threshold > self.health.unavailable_threshold {
            issues.push(err(
                "health.degraded_threshold",
                "must not exceed unavailable_threshold",
            ));
        }

        // ── Subagents ───────────────────────────────────────────────
        if self.subagents.max_concurrent_per_user == 0 {
            issues.push(err("subagents.max_concurrent_per_user", "must be at least 1"));
        }
        if self.subagents.max_concurrent_global < self.subagents.max_concurrent_per_user {
            issues.push(warn(
                "subagents.max_concurrent_global",
                "lower than the per-user cap, which can never be reached",
            ));
        }
        if self.subagents.default_token_budget > self.subagents.max_token_budget {
            issues.push(err(
                "subagents.default_token_budget",
                "exceeds max_token_budget",
            ));
        }
        if self.subagents.max_tool_calls_per_run == 0 {
            issues.push(err("subagents.max_tool_calls_per_run", "must be at least 1"));
        }
        if self.subagents.spawn_rate_limit.max_requests == 0
            || self.subagents.spawn_rate_limit.window_seconds == 0
        {
            issues.push(err(
                "subagents.spawn_rate_limit",
                "max_requests and window_seconds must both be greater than 0",
            ));
        }

        // ── Alerts ──────────────────────────────────────────────────
        for (event_type, rule) in &self.alerts.rules {
            if rule.channels.is_empty() {
                issues.push(err(
                    format!("alerts.rules.{event_type}.channels"),
                    "rule must name at least one sink",
                ));
            }
        }
        let qh = &self.alerts.quiet_hours;
        if qh.enabled {
            if parse_clock(&qh.start).is_none() {
                issues.push(err(
                    "alerts.quiet_hours.start",
                    format!("not a valid HH:MM clock (got \"{}\")", qh.start),
                ));
            }
            if parse_clock(&qh.end).is_none() {
                issues.push(err(
                    "alerts.quiet_hours.end",
                    format!("not a valid HH:MM clock (got \"{}\")", qh.end),
                ));
            }
            if qh.timezone.parse::<chrono_tz::Tz>().is_err() {
                issues.push(err(
                    "alerts.quiet_hours.timezone",
                    format!("unknown timezone \"{}\"", qh.timezone),
                ));
            }
        }

        // ── Scheduler ───────────────────────────────────────────────
        if self.scheduler.tick_seconds == 0 {
            issues.push(err("scheduler.tick_seconds", "must be greater than 0"));
        }
        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            issues.push(err(
                "scheduler.timezone",
                format!("unknown timezone \"{}\"", self.scheduler.timezone),
            ));
        }
        for (name, ov) in &self.scheduler.tasks {
            if let Some(cron) = &ov.cron {
                if cron.split_whitespace().count() != 5 {
                    issues.push(err(
                        format!("scheduler.tasks.{name}.cron"),
                        format!("expected 5 cron fields (got \"{cron}\")"),
                    ));
                }
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;

    fn find_issue<'a>(issues: &'a [ConfigError], field_prefix: &str) -> Option<&'a ConfigError> {
        issues.iter().find(|e| e.field.starts_with(field_prefix))
    }

    #[test]
    fn default_config_passes() {
        let issues = Config::default().validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn redis_backend_requires_url() {
        let mut cfg = Config::default();
        cfg.store.backend = StoreBackendKind::Redis;
        let issues = cfg.validate();
        let issue = find_issue(&issues, "store.redis_url").expect("expected redis_url error");
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn redis_url_scheme_checked() {
        let mut cfg = Config::default();
        cfg.store.backend = StoreBackendKind::Redis;
        cfg.store.redis_url = Some("http://localhost".into());
        let issues = cfg.validate();
        assert!(find_issue(&issues, "store.redis_url").is_some());

        cfg.store.redis_url = Some("redis://localhost:6379".into());
        let issues = cfg.validate();
        assert!(find_issue(&issues, "store.redis_url").is_none());
    }

    #[test]
    fn zero_max_retries_is_error() {
        let mut cfg = Config::default();
        cfg.bus.max_retries = 0;
        let issues = cfg.validate();
        let issue = find_issue(&issues, "bus.max_retries").unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn inverted_health_thresholds_is_error() {
        let mut cfg = Config::default();
        cfg.health.degraded_threshold = 20;
        cfg.health.unavailable_threshold = 10;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "health.degraded_threshold").is_some());
    }

    #[test]
    fn token_budget_over_ceiling_is_error() {
        let mut cfg = Config::default();
        cfg.subagents.default_token_budget = 500_000;
        cfg.subagents.max_token_budget = 200_000;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "subagents.default_token_budget").is_some());
    }

    #[test]
    fn global_cap_below_user_cap_is_warning() {
        let mut cfg = Config::default();
        cfg.subagents.max_concurrent_per_user = 5;
        cfg.subagents.max_concurrent_global = 2;
        let issues = cfg.validate();
        let issue = find_issue(&issues, "subagents.max_concurrent_global").unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn rule_without_channels_is_error() {
        let mut cfg = Config::default();
        cfg.alerts.rules.insert(
            "alert.email.urgent".into(),
            AlertRuleConfig {
                severity: Severity::Medium,
                channels: vec![],
                quiet_hours: true,
                cooldown: 60,
            },
        );
        let issues = cfg.validate();
        assert!(find_issue(&issues, "alerts.rules.alert.email.urgent.channels").is_some());
    }

    #[test]
    fn bad_quiet_hours_clock_is_error() {
        let mut cfg = Config::default();
        cfg.alerts.quiet_hours.enabled = true;
        cfg.alerts.quiet_hours.start = "25:00".into();
        let issues = cfg.validate();
        assert!(find_issue(&issues, "alerts.quiet_hours.start").is_some());
    }

    #[test]
    fn quiet_hours_ignored_when_disabled() {
        let mut cfg = Config::default();
        cfg.alerts.quiet_hours.enabled = false;
        cfg.alerts.quiet_hours.start = "nonsense".into();
        let issues = cfg.validate();
        assert!(find_issue(&issues, "alerts.quiet_hours").is_none());
    }

    #[test]
    fn bad_timezone_is_error() {
        let mut cfg = Config::default();
        cfg.alerts.quiet_hours.enabled = true;
        cfg.alerts.quiet_hours.timezone = "Mars/Olympus".into();
        let issues = cfg.validate();
        assert!(find_issue(&issues, "alerts.quiet_hours.timezone").is_some());
    }

    #[test]
    fn bad_cron_override_is_error() {
        let mut cfg = Config::default();
        cfg.scheduler.tasks.insert(
            "memory.daily_summary".into(),
            TaskOverride {
                cron: Some("0 9 *".into()),
                enabled: None,
            },
        );
        let issues = cfg.validate();
        assert!(find_issue(&issues, "scheduler.tasks.memory.daily_summary.cron").is_some());
    }

    #[test]
    fn config_error_display_format() {
        let e = err("bus.max_retries", "must be at least 1");
        assert_eq!(format!("{e}"), "[ERROR] bus.max_retries: must be at least 1");
    }

    #[test]
    fn full_config_from_toml() {
        let cfg: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/coda"

            [store]
            backend = "memory"

            [bus]
            consumer_group = "coda-prod"

            [alerts.rules."alert.email.urgent"]
            severity = "high"
            channels = ["discord"]
            cooldown = 300

            [alerts.quiet_hours]
            enabled = true
            start = "23:00"
            end = "07:00"
            timezone = "Europe/Stockholm"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bus.consumer_group, "coda-prod");
        assert!(cfg.alerts.rules.contains_key("alert.email.urgent"));
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }
}
