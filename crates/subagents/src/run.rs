//! The `SubagentRun` record and its forward-only status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status + mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Archived,
}

impl SubagentStatus {
    /// Terminal states admit no further mutation except archival.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Archived
        )
    }

    /// Whether `self -> to` is a legal forward transition.
    pub fn can_advance(self, to: SubagentStatus) -> bool {
        use SubagentStatus::*;
        matches!(
            (self, to),
            (Accepted, Running)
                | (Accepted, Failed)
                | (Accepted, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Succeeded, Archived)
                | (Failed, Archived)
                | (Cancelled, Archived)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentMode {
    Sync,
    Async,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript + envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One appended transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: &str, content: impl Into<String>, tool_name: Option<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_name,
            timestamp: Utc::now(),
        }
    }
}

/// Observability-only metadata attached to a run. Never consulted for
/// control decisions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Envelope {
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub requester_channel: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SubagentRun
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `subagent_runs` record, live in memory until archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentRun {
    pub id: Uuid,
    pub user_id: String,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub task: String,
    pub status: SubagentStatus,
    pub mode: SubagentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_tools: Vec<String>,
    pub tool_call_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub timeout_ms: u64,
    pub token_budget: u64,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Envelope>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl SubagentRun {
    pub fn new(
        user_id: &str,
        channel: &str,
        task: &str,
        mode: SubagentMode,
        timeout_ms: u64,
        token_budget: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            parent_run_id: None,
            task: task.to_string(),
            status: SubagentStatus::Accepted,
            mode,
            model: None,
            provider: None,
            allowed_tools: None,
            blocked_tools: Vec::new(),
            tool_call_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            timeout_ms,
            token_budget,
            transcript: Vec::new(),
            result: None,
            error: None,
            metadata: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            archived_at: None,
        }
    }

    /// Advance the status machine. Illegal transitions are refused and
    /// leave the record untouched.
    pub fn advance(&mut self, to: SubagentStatus) -> bool {
        if !self.status.can_advance(to) {
            tracing::warn!(
                run_id = %self.id,
                from = ?self.status,
                to = ?to,
                "illegal subagent status transition refused"
            );
            return false;
        }
        self.status = to;
        match to {
            SubagentStatus::Running => self.started_at = Some(Utc::now()),
            SubagentStatus::Archived => self.archived_at = Some(Utc::now()),
            _ if to.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
