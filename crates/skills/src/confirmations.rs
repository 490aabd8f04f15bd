//! One-shot confirmation tokens binding a pending tool call to the
//! principal who must authorize it, with abuse detection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use coda_bus::EventPublisher;
use coda_domain::{Event, Severity};

const TOKEN_LEN: usize = 10;
const DEFAULT_TTL_SECS: i64 = 300;
/// Invalid consume attempts tolerated per user per window.
const ABUSE_THRESHOLD: usize = 10;
const ABUSE_WINDOW_SECS: i64 = 600;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A pending confirmation. Consumed exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRecord {
    pub token: String,
    pub user_id: String,
    pub channel: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConfirmationManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-local store of pending confirmations, sticky per channel.
pub struct ConfirmationManager {
    pending: Mutex<HashMap<String, ConfirmationRecord>>,
    /// Per-user timestamps of invalid consume attempts.
    invalid_attempts: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    /// Users whose abuse alert already fired for the current window.
    flagged: Mutex<HashSet<String>>,
    publisher: Arc<dyn EventPublisher>,
    ttl: Duration,
}

impl ConfirmationManager {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self::with_ttl(publisher, DEFAULT_TTL_SECS)
    }

    pub fn with_ttl(publisher: Arc<dyn EventPublisher>, ttl_secs: i64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            invalid_attempts: Mutex::new(HashMap::new()),
            flagged: Mutex::new(HashSet::new()),
            publisher,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Create a confirmation bound to `(user, channel, tool, input)`.
    pub fn create(
        &self,
        user_id: &str,
        channel: &str,
        tool_name: &str,
        tool_input: Value,
        description: &str,
    ) -> ConfirmationRecord {
        let now = Utc::now();
        let record = ConfirmationRecord {
            token: generate_token(),
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
            description: description.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.pending
            .lock()
            .insert(record.token.clone(), record.clone());
        record
    }

    /// Consume a token. Returns the record iff the token exists, is
    /// unexpired, belongs to `user_id`, and the user is not currently
    /// flagged for abuse. Any other outcome counts as an invalid attempt.
    pub async fn consume(&self, token: &str, user_id: &str) -> Option<ConfirmationRecord> {
        self.purge_expired();

        if self.abuse_active(user_id) {
            tracing::warn!(user_id, "confirmation rejected: abuse threshold active");
            return None;
        }

        let taken = {
            let mut pending = self.pending.lock();
            match pending.get(token) {
                Some(record) if record.user_id == user_id => pending.remove(token),
                _ => None,
            }
        };

        match taken {
            Some(record) => Some(record),
            None => {
                self.record_invalid_attempt(user_id).await;
                None
            }
        }
    }

    /// Pending confirmations for introspection, newest first.
    pub fn list_pending(&self) -> Vec<ConfirmationRecord> {
        let mut all: Vec<_> = self.pending.lock().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    // ── Private ──────────────────────────────────────────────────────

    fn purge_expired(&self) {
        let now = Utc::now();
        self.pending.lock().retain(|_, r| r.expires_at > now);
    }

    /// Whether the user's invalid attempts currently exceed the
    /// threshold. Clears the alert flag once the window drains.
    fn abuse_active(&self, user_id: &str) -> bool {
        let mut attempts = self.invalid_attempts.lock();
        let Some(hits) = attempts.get_mut(user_id) else {
            return false;
        };
        let cutoff = Utc::now() - Duration::seconds(ABUSE_WINDOW_SECS);
        while hits.front().is_some_and(|t| *t < cutoff) {
            hits.pop_front();
        }
        if hits.len() >= ABUSE_THRESHOLD {
            true
        } else {
            self.flagged.lock().remove(user_id);
            false
        }
    }

    async fn record_invalid_attempt(&self, user_id: &str) {
        let crossed = {
            let mut attempts = self.invalid_attempts.lock();
            let hits = attempts.entry(user_id.to_string()).or_default();
            hits.push_back(Utc::now());
            hits.len() >= ABUSE_THRESHOLD && self.flagged.lock().insert(user_id.to_string())
        };

        if crossed {
            tracing::warn!(user_id, "confirmation abuse threshold crossed");
            let event = Event::new(
                "alert.system.abuse",
                "confirmations",
                Severity::High,
                serde_json::json!({
                    "user_id": user_id,
                    "invalid_attempts": ABUSE_THRESHOLD,
                    "window_seconds": ABUSE_WINDOW_SECS,
                }),
            );
            if let Err(e) = self.publisher.publish(event).await {
                tracing::warn!(error = %e, "failed to publish abuse alert");
            }
        }
    }
}

fn generate_token() -> String {
    // Hex from a v4 UUID, truncated: 8-12 alphanumeric chars required.
    uuid::Uuid::new_v4().simple().to_string()[..TOKEN_LEN].to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use coda_bus::CollectingPublisher;

    fn manager() -> (ConfirmationManager, Arc<CollectingPublisher>) {
        let publisher = Arc::new(CollectingPublisher::new());
        (ConfirmationManager::new(publisher.clone()), publisher)
    }

    fn create(mgr: &ConfirmationManager, user: &str) -> ConfirmationRecord {
        mgr.create(
            user,
            "discord",
            "email_send",
            serde_json::json!({"to": "a@b.c"}),
            "Send the drafted email",
        )
    }

    #[tokio::test]
    async fn token_shape() {
        let (mgr, _) = manager();
        let record = create(&mgr, "u1");
        assert!(record.token.len() >= 8 && record.token.len() <= 12);
        assert!(record.token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn consume_exactly_once() {
        let (mgr, _) = manager();
        let record = create(&mgr, "u1");

        let first = mgr.consume(&record.token, "u1").await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().tool_name, "email_send");

        let second = mgr.consume(&record.token, "u1").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn wrong_user_cannot_consume() {
        let (mgr, _) = manager();
        let record = create(&mgr, "u1");
        assert!(mgr.consume(&record.token, "u2").await.is_none());
        // The token is still intact for its owner.
        assert!(mgr.consume(&record.token, "u1").await.is_some());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let publisher = Arc::new(CollectingPublisher::new());
        let mgr = ConfirmationManager::with_ttl(publisher, 0);
        let record = create(&mgr, "u1");
        assert!(mgr.consume(&record.token, "u1").await.is_none());
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (mgr, _) = manager();
        assert!(mgr.consume("zzzzzzzzzz", "u1").await.is_none());
    }

    #[tokio::test]
    async fn abuse_threshold_blocks_valid_tokens() {
        let (mgr, publisher) = manager();
        let valid = create(&mgr, "attacker");
        let bystander = create(&mgr, "bystander");

        for _ in 0..ABUSE_THRESHOLD {
            assert!(mgr.consume("0000000000", "attacker").await.is_none());
        }

        // The valid token is now rejected too.
        assert!(mgr.consume(&valid.token, "attacker").await.is_none());

        // One abuse alert, not one per attempt.
        assert_eq!(publisher.count_of("alert.system.abuse"), 1);

        // Another user is unaffected.
        assert!(mgr.consume(&bystander.token, "bystander").await.is_some());
    }

    #[tokio::test]
    async fn abuse_alert_fires_once_per_trigger() {
        let (mgr, publisher) = manager();
        for _ in 0..(ABUSE_THRESHOLD + 5) {
            mgr.consume("0000000000", "attacker").await;
        }
        assert_eq!(publisher.count_of("alert.system.abuse"), 1);
    }

    #[tokio::test]
    async fn list_pending_newest_first() {
        let (mgr, _) = manager();
        create(&mgr, "u1");
        create(&mgr, "u2");
        let pending = mgr.list_pending();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].created_at >= pending[1].created_at);
    }
}
