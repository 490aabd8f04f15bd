//! The event model shared by the bus, the alert router, and everything
//! that publishes background activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Severity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Event severity. Ordered so that routing rules can express a minimum
/// (`Low < Medium < High`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single event travelling over the bus.
///
/// `event_id` is assigned on first publish when empty and is immutable
/// afterwards. The payload is opaque to the bus; only the alert router
/// and individual handlers interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub event_id: String,
    /// Dotted event type, e.g. `alert.email.urgent`.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the skill or subsystem that produced the event.
    pub source_skill: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Build a new event with a fresh id and the current timestamp.
    pub fn new(
        event_type: impl Into<String>,
        source_skill: impl Into<String>,
        severity: Severity,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: generate_event_id(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source_skill: source_skill.into(),
            severity,
            payload,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event ids
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crockford base32 alphabet (no I, L, O, U).
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a ULID-shaped, time-sortable event id: 26 Crockford base32
/// characters encoding a 48-bit millisecond timestamp followed by 80
/// random bits. Entropy comes from a v4 UUID.
pub fn generate_event_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let random = uuid::Uuid::new_v4();
    let bytes = random.as_bytes();

    let mut entropy: u128 = 0;
    for b in &bytes[..10] {
        entropy = (entropy << 8) | *b as u128;
    }

    let value: u128 = (millis << 80) | entropy;

    let mut out = [0u8; 26];
    for (i, slot) in out.iter_mut().enumerate() {
        // 26 groups of 5 bits, most significant first (130 bits, top 2 zero).
        let shift = 5 * (25 - i);
        let index = ((value >> shift) & 0x1f) as usize;
        *slot = CROCKFORD[index];
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn severity_snake_case_serialization() {
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"high\"");
        assert_eq!(
            serde_json::from_str::<Severity>("\"medium\"").unwrap(),
            Severity::Medium
        );
    }

    #[test]
    fn event_id_shape() {
        let id = generate_event_id();
        assert_eq!(id.len(), 26);
        assert!(id.bytes().all(|b| CROCKFORD.contains(&b)));
    }

    #[test]
    fn event_ids_are_unique() {
        let a = generate_event_id();
        let b = generate_event_id();
        assert_ne!(a, b);
    }

    #[test]
    fn event_ids_sort_by_time() {
        let earlier = generate_event_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = generate_event_id();
        assert!(earlier < later, "{earlier} should sort before {later}");
    }

    #[test]
    fn event_new_assigns_id_and_timestamp() {
        let event = Event::new(
            "alert.test.x",
            "tester",
            Severity::Low,
            serde_json::json!({"k": 1}),
        );
        assert_eq!(event.event_id.len(), 26);
        assert_eq!(event.event_type, "alert.test.x");
        assert_eq!(event.source_skill, "tester");
    }

    #[test]
    fn event_serde_roundtrip() {
        let event = Event::new(
            "subagent.succeeded",
            "subagents",
            Severity::Medium,
            serde_json::json!({"run_id": "r1"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.severity, event.severity);
        assert_eq!(back.payload, event.payload);
    }

    #[test]
    fn event_missing_optional_fields_deserializes() {
        let json = r#"{
            "event_type": "memory.saved",
            "timestamp": "2024-06-15T10:00:00Z",
            "source_skill": "memory"
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert!(event.event_id.is_empty());
        assert_eq!(event.severity, Severity::Low);
        assert!(event.payload.is_null());
    }
}
