//! The alert router: rule lookup and ordered gating (severity, quiet
//! hours, cooldown), then multi-sink delivery with per-sink isolation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;

use coda_bus::{EventBus, EventHandler};
use coda_domain::config::{parse_clock, AlertRuleConfig, AlertsConfig, QuietHoursConfig};
use coda_domain::{Event, Result};
use coda_store::KvBackend;

use crate::formatters::format_event;
use crate::history::{AlertHistoryRow, AlertHistoryStore};
use crate::preferences::{PreferencesProvider, UserPreferences};
use crate::sinks::AlertSink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Window math
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether `now` (minutes since local midnight) falls inside
/// `[start, end)`. A start after the end means the window crosses
/// midnight; equal bounds mean an empty window.
fn in_window(now: u32, start: u32, end: u32) -> bool {
    use std::cmp::Ordering;
    match start.cmp(&end) {
        Ordering::Equal => false,
        Ordering::Less => now >= start && now < end,
        Ordering::Greater => now >= start || now < end,
    }
}

fn local_minutes(now: &DateTime<Utc>, tz: chrono_tz::Tz) -> u32 {
    let local = now.with_timezone(&tz);
    local.hour() * 60 + local.minute()
}

fn global_quiet(qh: &QuietHoursConfig, now: &DateTime<Utc>) -> bool {
    if !qh.enabled {
        return false;
    }
    let (Some(start), Some(end)) = (parse_clock(&qh.start), parse_clock(&qh.end)) else {
        return false;
    };
    let tz = qh.timezone.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC);
    in_window(local_minutes(now, tz), start, end)
}

fn user_quiet(prefs: &UserPreferences, now: &DateTime<Utc>) -> bool {
    if prefs.dnd_enabled {
        return true;
    }
    let (Some(start), Some(end)) = (
        prefs.quiet_hours_start.as_deref().and_then(parse_clock),
        prefs.quiet_hours_end.as_deref().and_then(parse_clock),
    ) else {
        return false;
    };
    let tz = prefs.timezone.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC);
    in_window(local_minutes(now, tz), start, end)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AlertRouter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AlertRouter {
    rules: HashMap<String, AlertRuleConfig>,
    quiet_hours: QuietHoursConfig,
    kv: Arc<dyn KvBackend>,
    sinks: RwLock<HashMap<String, Arc<dyn AlertSink>>>,
    history: Arc<AlertHistoryStore>,
    prefs: Arc<dyn PreferencesProvider>,
    /// The principal alerts default to when an event names no user.
    default_user: Option<String>,
}

impl AlertRouter {
    pub fn new(
        config: AlertsConfig,
        kv: Arc<dyn KvBackend>,
        history: Arc<AlertHistoryStore>,
        prefs: Arc<dyn PreferencesProvider>,
        default_user: Option<String>,
    ) -> Self {
        Self {
            rules: config.rules,
            quiet_hours: config.quiet_hours,
            kv,
            sinks: RwLock::new(HashMap::new()),
            history,
            prefs,
            default_user,
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().insert(sink.name().to_string(), sink);
    }

    /// Subscribe this router to `alert.*` on the bus.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<String> {
        bus.subscribe("alert.*", self.clone())
    }

    pub async fn route(&self, event: &Event) -> Result<()> {
        self.route_at(event, Utc::now()).await
    }

    /// Routing pipeline with an injectable clock.
    pub async fn route_at(&self, event: &Event, now: DateTime<Utc>) -> Result<()> {
        // 1. Rule lookup by exact event type.
        let Some(rule) = self.rules.get(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "no alert rule, ignoring");
            return Ok(());
        };

        // 2. Minimum severity.
        if event.severity < rule.severity {
            self.suppress(event, "severity");
            return Ok(());
        }

        // 3. Quiet hours: global window and per-user preferences both
        // have to permit delivery. High-severity overrides bypass both.
        if rule.quiet_hours && !self.quiet_hours.override_severities.contains(&event.severity) {
            let user = event
                .payload
                .get("user_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| self.default_user.clone());
            let user_prefs = user.as_deref().and_then(|u| self.prefs.get(u));

            let blocked = global_quiet(&self.quiet_hours, &now)
                || user_prefs.as_ref().is_some_and(|p| user_quiet(p, &now));
            if blocked {
                self.suppress(event, "quiet_hours");
                return Ok(());
            }
        }

        // 4. Cooldown claim in the shared store.
        if rule.cooldown > 0 {
            let key = format!("cooldown:{}:{}", event.event_type, event.source_skill);
            let claimed = self.kv.set_nx_ex(&key, "1", rule.cooldown).await?;
            if !claimed {
                self.suppress(event, "cooldown");
                return Ok(());
            }
        }

        // 5. Deliver to every channel; sink failures are isolated.
        let formatted = format_event(event);
        let sinks = self.sinks.read().clone();
        for channel in &rule.channels {
            let Some(sink) = sinks.get(channel) else {
                tracing::warn!(channel = %channel, "no sink registered for alert channel");
                continue;
            };
            let result = if sink.supports_rich() {
                sink.send_rich(channel, &formatted).await
            } else {
                sink.send(channel, &formatted.plain).await
            };
            if let Err(e) = result {
                tracing::warn!(channel = %channel, error = %e, "alert sink delivery failed");
            }
        }

        // 6. History row.
        self.history.record(AlertHistoryRow::delivered(
            event,
            &rule.channels,
            &formatted.plain,
        ));
        Ok(())
    }

    fn suppress(&self, event: &Event, reason: &str) {
        tracing::debug!(
            event_type = %event.event_type,
            reason,
            "alert suppressed"
        );
        self.history.record(AlertHistoryRow::suppressed(event, reason));
    }
}

#[async_trait]
impl EventHandler for AlertRouter {
    async fn handle(&self, event: &Event) -> Result<()> {
        self.route(event).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use coda_domain::Severity;
    use coda_store::MemoryBackend;

    use crate::preferences::NoPreferences;
    use crate::sinks::RecordingSink;

    struct Fixture {
        router: Arc<AlertRouter>,
        sink: Arc<RecordingSink>,
        history: Arc<AlertHistoryStore>,
        _dir: tempfile::TempDir,
    }

    fn rule(severity: Severity, cooldown: u64, quiet_hours: bool) -> AlertRuleConfig {
        AlertRuleConfig {
            severity,
            channels: vec!["discord".into()],
            quiet_hours,
            cooldown,
        }
    }

    fn fixture(config: AlertsConfig) -> Fixture {
        fixture_with_prefs(config, Arc::new(NoPreferences), None)
    }

    fn fixture_with_prefs(
        config: AlertsConfig,
        prefs: Arc<dyn PreferencesProvider>,
        default_user: Option<String>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(AlertHistoryStore::open(dir.path().join("alert_history.jsonl")));
        let router = Arc::new(AlertRouter::new(
            config,
            Arc::new(MemoryBackend::new()),
            history.clone(),
            prefs,
            default_user,
        ));
        let sink = Arc::new(RecordingSink::new("discord"));
        router.register_sink(sink.clone());
        Fixture {
            router,
            sink,
            history,
            _dir: dir,
        }
    }

    fn urgent_email(severity: Severity) -> Event {
        Event::new(
            "alert.email.urgent",
            "email",
            severity,
            serde_json::json!({"message": "check this"}),
        )
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn no_rule_means_no_row_and_no_delivery() {
        let f = fixture(AlertsConfig::default());
        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();
        assert_eq!(f.sink.total(), 0);
        assert!(f.history.is_empty());
    }

    #[tokio::test]
    async fn delivery_records_history() {
        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Medium, 0, true));
        let f = fixture(config);

        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();

        assert_eq!(f.sink.rich_sent().len(), 1);
        let rows = f.history.recent(10);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].delivered);
        assert!(!rows[0].suppressed);
        assert_eq!(rows[0].channel.as_deref(), Some("discord"));
        assert!(rows[0].formatted_message.is_some());
    }

    #[tokio::test]
    async fn low_severity_is_suppressed() {
        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Medium, 0, true));
        let f = fixture(config);

        f.router.route_at(&urgent_email(Severity::Low), noon()).await.unwrap();

        assert_eq!(f.sink.total(), 0);
        let rows = f.history.recent(10);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].suppressed);
        assert!(!rows[0].delivered);
        assert_eq!(rows[0].suppression_reason.as_deref(), Some("severity"));
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_event() {
        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Low, 300, true));
        let f = fixture(config);

        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();
        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();

        // Exactly one rich delivery; the second event left a cooldown row.
        assert_eq!(f.sink.rich_sent().len(), 1);
        let rows = f.history.recent(10);
        assert_eq!(rows.len(), 2);
        let suppressed = &rows[0];
        assert!(suppressed.suppressed);
        assert_eq!(suppressed.suppression_reason.as_deref(), Some("cooldown"));
        assert!(!suppressed.delivered);
    }

    #[tokio::test]
    async fn cooldown_is_per_source_skill() {
        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Low, 300, true));
        let f = fixture(config);

        let mut other = urgent_email(Severity::High);
        other.source_skill = "calendar".into();

        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();
        f.router.route_at(&other, noon()).await.unwrap();
        assert_eq!(f.sink.rich_sent().len(), 2);
    }

    #[tokio::test]
    async fn quiet_hours_suppresses_and_records() {
        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Low, 0, true));
        config.quiet_hours = QuietHoursConfig {
            enabled: true,
            start: "08:00".into(),
            end: "20:00".into(),
            timezone: "UTC".into(),
            override_severities: vec![Severity::High],
        };
        let f = fixture(config);

        // Noon falls inside the window; medium severity has no override.
        f.router.route_at(&urgent_email(Severity::Medium), noon()).await.unwrap();
        assert_eq!(f.sink.total(), 0);
        let rows = f.history.recent(10);
        assert!(rows[0].suppressed);
        assert!(!rows[0].delivered);
        assert_eq!(rows[0].suppression_reason.as_deref(), Some("quiet_hours"));

        // High severity overrides the window.
        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();
        assert_eq!(f.sink.rich_sent().len(), 1);
    }

    #[tokio::test]
    async fn quiet_hours_ineligible_rule_delivers() {
        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Low, 0, false));
        config.quiet_hours = QuietHoursConfig {
            enabled: true,
            start: "00:00".into(),
            end: "23:59".into(),
            timezone: "UTC".into(),
            override_severities: vec![],
        };
        let f = fixture(config);

        f.router.route_at(&urgent_email(Severity::Low), noon()).await.unwrap();
        assert_eq!(f.sink.rich_sent().len(), 1);
    }

    #[tokio::test]
    async fn user_dnd_suppresses() {
        struct DndPrefs;
        impl PreferencesProvider for DndPrefs {
            fn get(&self, user_id: &str) -> Option<UserPreferences> {
                let mut prefs = UserPreferences::new(user_id);
                prefs.dnd_enabled = true;
                Some(prefs)
            }
        }

        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Low, 0, true));
        let f = fixture_with_prefs(config, Arc::new(DndPrefs), Some("u1".into()));

        f.router.route_at(&urgent_email(Severity::Medium), noon()).await.unwrap();
        assert_eq!(f.sink.total(), 0);
        assert_eq!(
            f.history.recent(1)[0].suppression_reason.as_deref(),
            Some("quiet_hours")
        );
    }

    #[tokio::test]
    async fn user_personal_window_suppresses_without_global() {
        struct WindowPrefs;
        impl PreferencesProvider for WindowPrefs {
            fn get(&self, user_id: &str) -> Option<UserPreferences> {
                let mut prefs = UserPreferences::new(user_id);
                prefs.quiet_hours_start = Some("08:00".into());
                prefs.quiet_hours_end = Some("20:00".into());
                Some(prefs)
            }
        }

        let mut config = AlertsConfig::default();
        config.rules.insert("alert.email.urgent".into(), rule(Severity::Low, 0, true));
        // Global quiet hours disabled: only the user's window applies.
        let f = fixture_with_prefs(config, Arc::new(WindowPrefs), Some("u1".into()));

        f.router.route_at(&urgent_email(Severity::Medium), noon()).await.unwrap();
        assert_eq!(f.sink.total(), 0);
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_other_channels() {
        let mut config = AlertsConfig::default();
        config.rules.insert(
            "alert.email.urgent".into(),
            AlertRuleConfig {
                severity: Severity::Low,
                channels: vec!["broken".into(), "discord".into()],
                quiet_hours: false,
                cooldown: 0,
            },
        );
        let f = fixture(config);
        let broken = Arc::new(RecordingSink::new("broken"));
        broken.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        f.router.register_sink(broken);

        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();

        // The healthy sink still received the alert, and the history row
        // was appended.
        assert_eq!(f.sink.rich_sent().len(), 1);
        assert!(f.history.recent(1)[0].delivered);
    }

    #[tokio::test]
    async fn unregistered_channel_is_skipped() {
        let mut config = AlertsConfig::default();
        config.rules.insert(
            "alert.email.urgent".into(),
            AlertRuleConfig {
                severity: Severity::Low,
                channels: vec!["missing".into(), "discord".into()],
                quiet_hours: false,
                cooldown: 0,
            },
        );
        let f = fixture(config);
        f.router.route_at(&urgent_email(Severity::High), noon()).await.unwrap();
        assert_eq!(f.sink.rich_sent().len(), 1);
    }

    // ── Window math ─────────────────────────────────────────────────

    #[test]
    fn window_same_day() {
        let start = parse_clock("08:00").unwrap();
        let end = parse_clock("20:00").unwrap();
        assert!(in_window(parse_clock("12:00").unwrap(), start, end));
        assert!(!in_window(parse_clock("21:00").unwrap(), start, end));
        assert!(in_window(start, start, end));
        assert!(!in_window(end, start, end));
    }

    #[test]
    fn window_crossing_midnight() {
        let start = parse_clock("22:00").unwrap();
        let end = parse_clock("08:00").unwrap();
        assert!(in_window(parse_clock("23:30").unwrap(), start, end));
        assert!(in_window(parse_clock("03:00").unwrap(), start, end));
        assert!(!in_window(parse_clock("12:00").unwrap(), start, end));
    }

    #[test]
    fn empty_window_never_matches() {
        let at = parse_clock("10:00").unwrap();
        assert!(!in_window(at, at, at));
    }
}
