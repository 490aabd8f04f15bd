//! Persisted alert history: one append-only row per routing decision,
//! delivered or suppressed.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coda_domain::{Event, Severity};
use coda_store::JsonlTable;

const HISTORY_CAP: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryRow {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub severity: Severity,
    pub source_skill: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_message: Option<String>,
    pub delivered: bool,
    pub suppressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlertHistoryRow {
    fn base(event: &Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            severity: event.severity,
            source_skill: event.source_skill.clone(),
            channel: None,
            payload: event.payload.clone(),
            formatted_message: None,
            delivered: false,
            suppressed: false,
            suppression_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn delivered(event: &Event, channels: &[String], formatted: &str) -> Self {
        Self {
            channel: Some(channels.join(",")),
            formatted_message: Some(formatted.to_string()),
            delivered: true,
            ..Self::base(event)
        }
    }

    pub fn suppressed(event: &Event, reason: &str) -> Self {
        Self {
            suppressed: true,
            suppression_reason: Some(reason.to_string()),
            ..Self::base(event)
        }
    }
}

/// The `alert_history` table.
pub struct AlertHistoryStore {
    table: JsonlTable<AlertHistoryRow>,
}

impl AlertHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            table: JsonlTable::open(path.as_ref().to_path_buf(), HISTORY_CAP),
        }
    }

    pub fn record(&self, row: AlertHistoryRow) {
        self.table.append(row);
    }

    pub fn recent(&self, limit: usize) -> Vec<AlertHistoryRow> {
        self.table.recent(limit)
    }

    pub fn for_event(&self, event_id: &str) -> Vec<AlertHistoryRow> {
        self.table.filter(|r| r.event_id == event_id, usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event::new(
            "alert.email.urgent",
            "email",
            Severity::High,
            serde_json::json!({"message": "x"}),
        )
    }

    #[test]
    fn delivered_row_shape() {
        let e = event();
        let row = AlertHistoryRow::delivered(&e, &["discord".into(), "push".into()], "plain text");
        assert!(row.delivered);
        assert!(!row.suppressed);
        assert_eq!(row.channel.as_deref(), Some("discord,push"));
        assert_eq!(row.formatted_message.as_deref(), Some("plain text"));
        assert_eq!(row.event_id, e.event_id);
    }

    #[test]
    fn suppressed_row_shape() {
        let e = event();
        let row = AlertHistoryRow::suppressed(&e, "cooldown");
        assert!(!row.delivered);
        assert!(row.suppressed);
        assert_eq!(row.suppression_reason.as_deref(), Some("cooldown"));
    }

    #[test]
    fn store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertHistoryStore::open(dir.path().join("alert_history.jsonl"));
        let e = event();
        store.record(AlertHistoryRow::suppressed(&e, "severity"));
        store.record(AlertHistoryRow::delivered(&e, &["log".into()], "text"));

        assert_eq!(store.len(), 2);
        let rows = store.for_event(&e.event_id);
        assert_eq!(rows.len(), 2);

        // Reopen: rows persisted.
        drop(store);
        let store = AlertHistoryStore::open(dir.path().join("alert_history.jsonl"));
        assert_eq!(store.len(), 2);
    }
}
