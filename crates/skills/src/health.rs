//! Per-skill health: success/failure counters and the
//! healthy → degraded → unavailable state machine with recovery probing.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use coda_domain::config::HealthConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// Health record for a single skill.
#[derive(Debug, Clone, Serialize)]
pub struct SkillHealth {
    pub status: SkillStatus,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl SkillHealth {
    fn new() -> Self {
        Self {
            status: SkillStatus::Healthy,
            consecutive_failures: 0,
            last_failure: None,
            last_success: None,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// Outcome of asking whether a skill may take a call right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// The recovery window elapsed; one attempt is permitted and the
    /// skill has been moved to degraded.
    Probe,
    Deny {
        retry_in_ms: u64,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HealthTracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lock-protected health map, updated by the registry on every tool call.
pub struct HealthTracker {
    config: HealthConfig,
    skills: RwLock<HashMap<String, SkillHealth>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            skills: RwLock::new(HashMap::new()),
        }
    }

    /// Any success resets the skill to healthy.
    pub fn record_success(&self, skill: &str) {
        let mut skills = self.skills.write();
        let health = skills
            .entry(skill.to_string())
            .or_insert_with(SkillHealth::new);
        health.status = SkillStatus::Healthy;
        health.consecutive_failures = 0;
        health.last_success = Some(Utc::now());
        health.total_successes += 1;
    }

    pub fn record_failure(&self, skill: &str) {
        let mut skills = self.skills.write();
        let health = skills
            .entry(skill.to_string())
            .or_insert_with(SkillHealth::new);
        health.consecutive_failures += 1;
        health.last_failure = Some(Utc::now());
        health.total_failures += 1;

        if health.consecutive_failures >= self.config.unavailable_threshold {
            if health.status != SkillStatus::Unavailable {
                tracing::warn!(
                    skill,
                    failures = health.consecutive_failures,
                    "skill marked unavailable"
                );
            }
            health.status = SkillStatus::Unavailable;
        } else if health.consecutive_failures >= self.config.degraded_threshold {
            health.status = SkillStatus::Degraded;
        }
    }

    /// Gate for the execution pipeline. An unavailable skill inside the
    /// recovery window is denied; past the window it is flipped to
    /// degraded and granted a single probe attempt.
    pub fn admit(&self, skill: &str) -> Admission {
        let mut skills = self.skills.write();
        let Some(health) = skills.get_mut(skill) else {
            return Admission::Allow;
        };
        if health.status != SkillStatus::Unavailable {
            return Admission::Allow;
        }

        let window = Duration::milliseconds(self.config.recovery_window_ms as i64);
        let elapsed = health
            .last_failure
            .map(|at| Utc::now().signed_duration_since(at));
        match elapsed {
            Some(elapsed) if elapsed < window => Admission::Deny {
                retry_in_ms: (window - elapsed).num_milliseconds().max(0) as u64,
            },
            _ => {
                health.status = SkillStatus::Degraded;
                tracing::info!(skill, "recovery probe permitted");
                Admission::Probe
            }
        }
    }

    /// Current status; unknown skills are healthy.
    pub fn status(&self, skill: &str) -> SkillStatus {
        self.skills
            .read()
            .get(skill)
            .map_or(SkillStatus::Healthy, |h| h.status)
    }

    pub fn get(&self, skill: &str) -> Option<SkillHealth> {
        self.skills.read().get(skill).cloned()
    }

    /// Snapshot of every tracked skill, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, SkillHealth)> {
        let mut all: Vec<_> = self
            .skills
            .read()
            .iter()
            .map(|(name, health)| (name.clone(), health.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Periodic sweep: flip unavailable skills whose window elapsed to
    /// degraded so the next call probes them. Returns the flipped names.
    pub fn probe_tick(&self) -> Vec<String> {
        let window = Duration::milliseconds(self.config.recovery_window_ms as i64);
        let now = Utc::now();
        let mut flipped = Vec::new();
        let mut skills = self.skills.write();
        for (name, health) in skills.iter_mut() {
            if health.status == SkillStatus::Unavailable {
                let past_window = health
                    .last_failure
                    .is_none_or(|at| now.signed_duration_since(at) >= window);
                if past_window {
                    health.status = SkillStatus::Degraded;
                    flipped.push(name.clone());
                }
            }
        }
        flipped
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(degraded: u32, unavailable: u32, window_ms: u64) -> HealthTracker {
        HealthTracker::new(HealthConfig {
            degraded_threshold: degraded,
            unavailable_threshold: unavailable,
            recovery_window_ms: window_ms,
        })
    }

    #[test]
    fn unknown_skill_is_healthy_and_admitted() {
        let t = tracker(3, 10, 60_000);
        assert_eq!(t.status("notes"), SkillStatus::Healthy);
        assert_eq!(t.admit("notes"), Admission::Allow);
    }

    #[test]
    fn degradation_thresholds() {
        let t = tracker(3, 5, 60_000);
        t.record_failure("email");
        t.record_failure("email");
        assert_eq!(t.status("email"), SkillStatus::Healthy);
        t.record_failure("email");
        assert_eq!(t.status("email"), SkillStatus::Degraded);
        t.record_failure("email");
        t.record_failure("email");
        assert_eq!(t.status("email"), SkillStatus::Unavailable);
    }

    #[test]
    fn success_resets_to_healthy() {
        let t = tracker(3, 5, 60_000);
        for _ in 0..5 {
            t.record_failure("email");
        }
        assert_eq!(t.status("email"), SkillStatus::Unavailable);

        t.record_success("email");
        let health = t.get("email").unwrap();
        assert_eq!(health.status, SkillStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 5);
        assert_eq!(health.total_successes, 1);
    }

    #[test]
    fn unavailable_is_denied_inside_window() {
        let t = tracker(3, 5, 60_000);
        for _ in 0..5 {
            t.record_failure("email");
        }
        match t.admit("email") {
            Admission::Deny { retry_in_ms } => assert!(retry_in_ms <= 60_000),
            other => panic!("expected Deny, got {other:?}"),
        }
        // Denial does not change status.
        assert_eq!(t.status("email"), SkillStatus::Unavailable);
    }

    #[test]
    fn probe_after_window_flips_to_degraded() {
        let t = tracker(3, 5, 50);
        for _ in 0..5 {
            t.record_failure("email");
        }
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(t.admit("email"), Admission::Probe);
        assert_eq!(t.status("email"), SkillStatus::Degraded);
        // A degraded skill is allowed normally.
        assert_eq!(t.admit("email"), Admission::Allow);
    }

    #[test]
    fn failed_probe_restarts_the_window() {
        let t = tracker(3, 5, 50);
        for _ in 0..5 {
            t.record_failure("email");
        }
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(t.admit("email"), Admission::Probe);

        // Probe attempt fails: back to unavailable with a fresh window.
        t.record_failure("email");
        assert_eq!(t.status("email"), SkillStatus::Unavailable);
        assert!(matches!(t.admit("email"), Admission::Deny { .. }));
    }

    #[test]
    fn probe_tick_flips_expired_skills() {
        let t = tracker(3, 5, 50);
        for _ in 0..5 {
            t.record_failure("email");
        }
        assert!(t.probe_tick().is_empty(), "window not elapsed yet");
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(t.probe_tick(), vec!["email".to_string()]);
        assert_eq!(t.status("email"), SkillStatus::Degraded);
    }

    #[test]
    fn snapshot_is_sorted() {
        let t = tracker(3, 5, 60_000);
        t.record_success("zeta");
        t.record_success("alpha");
        let snap = t.snapshot();
        assert_eq!(snap[0].0, "alpha");
        assert_eq!(snap[1].0, "zeta");
    }
}
