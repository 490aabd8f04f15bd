//! The subagent manager: admission checks, sync and async execution,
//! cancellation, archival, and specialist presets.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use coda_bus::EventPublisher;
use coda_domain::cancel::CancelToken;
use coda_domain::config::SubagentsConfig;
use coda_domain::{Error, Event, Result, Severity};
use coda_providers::ChatProvider;
use coda_skills::{RateLimiter, SkillRegistry, ToolFilter};
use coda_store::{JsonlTable, KvBackend};

use crate::agent_loop::{run_tool_loop, LoopEnd, LoopOutcome, LoopParams};
use crate::run::{Envelope, SubagentMode, SubagentRun, SubagentStatus, TranscriptEntry};

const ARCHIVE_CAP: usize = 2000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Correlation context travelling with the caller. A populated
/// `subagent_run_id` marks a call originating inside a subagent run.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub subagent_run_id: Option<String>,
}

impl CallContext {
    /// A top-level caller (chat turn, scheduler, API).
    pub fn root() -> Self {
        Self::default()
    }

    /// The context handed to tools executing inside a run.
    pub fn within_run(run_id: &str) -> Self {
        Self {
            subagent_run_id: Some(run_id.to_string()),
        }
    }
}

/// Input for both spawn modes.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub user_id: String,
    pub channel: String,
    pub task: String,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub blocked_tools: Vec<String>,
    pub timeout_minutes: Option<u64>,
    pub token_budget: Option<u64>,
    pub system_prompt: Option<String>,
    pub metadata: Option<Envelope>,
}

impl SpawnRequest {
    pub fn new(user_id: &str, channel: &str, task: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            task: task.to_string(),
            model: None,
            allowed_tools: None,
            blocked_tools: Vec::new(),
            timeout_minutes: None,
            token_budget: None,
            system_prompt: None,
            metadata: None,
        }
    }
}

/// Returned by an async spawn before any provider I/O happens.
#[derive(Debug, Clone)]
pub struct SpawnAccepted {
    pub run_id: Uuid,
    pub status: SubagentStatus,
}

/// Invoked after an async run reaches a terminal state so the
/// orchestrator can announce the result on the originating channel.
#[async_trait]
pub trait AnnounceCallback: Send + Sync {
    async fn announce(&self, channel: &str, run: &SubagentRun);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SubagentManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SubagentManager {
    config: SubagentsConfig,
    registry: Arc<SkillRegistry>,
    provider: Arc<dyn ChatProvider>,
    publisher: Arc<dyn EventPublisher>,
    limiter: RateLimiter,
    runs: RwLock<HashMap<Uuid, SubagentRun>>,
    cancels: Mutex<HashMap<Uuid, CancelToken>>,
    archive: JsonlTable<SubagentRun>,
    announce: Option<Arc<dyn AnnounceCallback>>,
    shutdown: CancelToken,
}

impl SubagentManager {
    pub fn new(
        config: SubagentsConfig,
        registry: Arc<SkillRegistry>,
        provider: Arc<dyn ChatProvider>,
        publisher: Arc<dyn EventPublisher>,
        kv: Arc<dyn KvBackend>,
        archive_path: impl AsRef<Path>,
        announce: Option<Arc<dyn AnnounceCallback>>,
    ) -> Self {
        Self {
            config,
            registry,
            provider,
            publisher,
            limiter: RateLimiter::new(kv),
            runs: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            archive: JsonlTable::open(archive_path.as_ref().to_path_buf(), ARCHIVE_CAP),
            announce,
            shutdown: CancelToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    // ── Admission ────────────────────────────────────────────────────

    /// The admission pipeline shared by both modes, in order: feature
    /// flag, recursion guard, rate limit, per-user cap, global cap,
    /// unknown tools.
    async fn admit(&self, ctx: &CallContext, req: &SpawnRequest) -> Result<()> {
        if !self.config.enabled {
            return Err(Error::Disabled("subagents are disabled".into()));
        }
        if ctx.subagent_run_id.is_some() {
            return Err(Error::RecursionBlocked(
                "subagents cannot spawn further subagents".into(),
            ));
        }

        let rl = &self.config.spawn_rate_limit;
        let decision = self
            .limiter
            .check("subagent_spawn", &req.user_id, rl.max_requests, rl.window_seconds)
            .await?;
        if !decision.allowed {
            return Err(Error::RateLimited {
                retry_after_ms: decision.retry_after_ms.unwrap_or(rl.window_seconds * 1000),
            });
        }

        if self.active_count_for(&req.user_id) >= self.config.max_concurrent_per_user {
            return Err(Error::Saturated(format!(
                "user {} already has {} active subagent runs",
                req.user_id, self.config.max_concurrent_per_user
            )));
        }
        if self.active_count() >= self.config.max_concurrent_global {
            return Err(Error::Saturated(
                "global subagent capacity reached".into(),
            ));
        }

        if let Some(allowed) = &req.allowed_tools {
            let unknown: Vec<&str> = allowed
                .iter()
                .map(String::as_str)
                .filter(|name| !self.registry.has_tool(name))
                .collect();
            if !unknown.is_empty() {
                return Err(Error::UnknownTool(unknown.join(", ")));
            }
        }
        Ok(())
    }

    // ── Spawning ─────────────────────────────────────────────────────

    /// Async mode: admission, then `accepted` is returned before any
    /// provider I/O. The loop runs on its own task.
    pub async fn spawn(self: &Arc<Self>, ctx: &CallContext, req: SpawnRequest) -> Result<SpawnAccepted> {
        self.admit(ctx, &req).await?;

        let timeout_minutes = req
            .timeout_minutes
            .unwrap_or(self.config.default_timeout_minutes)
            .min(self.config.max_timeout_minutes);
        let run = self.insert_run(&req, SubagentMode::Async, timeout_minutes * 60_000);
        let run_id = run.run_id;
        let cancel = run.cancel;

        self.publish_event(
            "subagent.spawned",
            run_id,
            &req.user_id,
            &req.channel,
            None,
        )
        .await;

        let manager = self.clone();
        let system_prompt = req.system_prompt;
        tokio::spawn(async move {
            manager.execute(run_id, cancel, system_prompt).await;
        });

        Ok(SpawnAccepted {
            run_id,
            status: SubagentStatus::Accepted,
        })
    }

    /// Sync mode: the loop runs on the caller under the sync wall-clock
    /// and the final text is returned directly.
    pub async fn delegate_sync(&self, ctx: &CallContext, req: SpawnRequest) -> Result<String> {
        self.admit(ctx, &req).await?;

        let inserted = self.insert_run(&req, SubagentMode::Sync, self.config.sync_timeout_seconds * 1000);
        let run_id = inserted.run_id;
        let cancel = inserted.cancel;

        let (status, result, error) = self
            .execute_inner(run_id, cancel, req.system_prompt)
            .await;

        match status {
            SubagentStatus::Succeeded => Ok(result.unwrap_or_default()),
            SubagentStatus::Cancelled => Err(Error::Other("subagent run was cancelled".into())),
            _ => Err(Error::Other(
                error.unwrap_or_else(|| "subagent run failed".into()),
            )),
        }
    }

    /// Resolve a named specialist preset and delegate synchronously.
    pub async fn specialist_spawn(
        &self,
        ctx: &CallContext,
        specialist: &str,
        user_id: &str,
        channel: &str,
        task: &str,
    ) -> Result<String> {
        let preset = self
            .config
            .specialists
            .get(specialist)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("unknown specialist \"{specialist}\"")))?;

        let mut req = SpawnRequest::new(user_id, channel, task);
        req.system_prompt = Some(preset.system_prompt);
        if !preset.allowed_tools.is_empty() {
            req.allowed_tools = Some(preset.allowed_tools);
        }
        req.token_budget = preset.token_budget;
        self.delegate_sync(ctx, req).await
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Request cancellation of a run. Only the owner may stop it; the
    /// flag is observed at the next loop boundary and
    /// `subagent.cancelled` is published when that happens.
    pub fn stop_run(&self, user_id: &str, run_id: &Uuid) -> Result<bool> {
        let runs = self.runs.read();
        let Some(run) = runs.get(run_id) else {
            return Err(Error::InvalidInput(format!("unknown run {run_id}")));
        };
        if run.user_id != user_id {
            return Err(Error::Policy("only the owner may stop a run".into()));
        }
        if run.status.is_terminal() {
            return Ok(false);
        }
        drop(runs);

        if let Some(cancel) = self.cancels.lock().get(run_id) {
            cancel.cancel();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// A run record, live or archived.
    pub fn get_run_info(&self, run_id: &Uuid) -> Option<SubagentRun> {
        if let Some(run) = self.runs.read().get(run_id) {
            return Some(run.clone());
        }
        self.archive.find(|r| r.id == *run_id)
    }

    /// A run's transcript, live or archived.
    pub fn get_run_log(&self, run_id: &Uuid) -> Option<Vec<TranscriptEntry>> {
        self.get_run_info(run_id).map(|r| r.transcript)
    }

    /// Live runs, newest first, optionally one user's.
    pub fn list_runs(&self, user_id: Option<&str>) -> Vec<SubagentRun> {
        let mut runs: Vec<SubagentRun> = self
            .runs
            .read()
            .values()
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn active_count(&self) -> usize {
        self.runs
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    pub fn active_count_for(&self, user_id: &str) -> usize {
        self.runs
            .read()
            .values()
            .filter(|r| r.user_id == user_id && !r.status.is_terminal())
            .count()
    }

    // ── Archival ─────────────────────────────────────────────────────

    /// Move terminal runs older than the archive TTL into the persisted
    /// archive. Returns how many were archived.
    pub fn cleanup_tick(&self) -> usize {
        let ttl = chrono::Duration::minutes(self.config.archive_ttl_minutes as i64);
        let now = Utc::now();

        let expired: Vec<Uuid> = self
            .runs
            .read()
            .values()
            .filter(|r| {
                r.status.is_terminal()
                    && r.completed_at
                        .is_some_and(|at| now.signed_duration_since(at) >= ttl)
            })
            .map(|r| r.id)
            .collect();

        for run_id in &expired {
            let archived = {
                let mut runs = self.runs.write();
                let Some(mut run) = runs.remove(run_id) else {
                    continue;
                };
                run.advance(SubagentStatus::Archived);
                run
            };
            self.cancels.lock().remove(run_id);
            self.archive.append(archived);
            tracing::debug!(run_id = %run_id, "subagent run archived");
        }
        expired.len()
    }

    /// Periodic archival sweep; stops when the shutdown token fires.
    pub async fn run_cleanup_loop(&self) {
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds.max(1));
        while !self.shutdown.is_cancelled() {
            tokio::time::sleep(interval).await;
            self.cleanup_tick();
        }
    }

    // ── Private ──────────────────────────────────────────────────────

    fn insert_run(&self, req: &SpawnRequest, mode: SubagentMode, timeout_ms: u64) -> InsertedRun {
        let budget = req
            .token_budget
            .unwrap_or(self.config.default_token_budget)
            .min(self.config.max_token_budget);

        let mut run = SubagentRun::new(&req.user_id, &req.channel, &req.task, mode, timeout_ms, budget);
        run.model = req.model.clone();
        run.provider = Some(self.provider.provider_id().to_string());
        run.allowed_tools = req.allowed_tools.clone();
        run.blocked_tools = req.blocked_tools.clone();
        run.metadata = req.metadata.clone();

        let run_id = run.id;
        let cancel = CancelToken::new();
        self.runs.write().insert(run_id, run);
        self.cancels.lock().insert(run_id, cancel.clone());
        InsertedRun { run_id, cancel }
    }

    async fn execute(self: Arc<Self>, run_id: Uuid, cancel: CancelToken, system_prompt: Option<String>) {
        self.execute_inner(run_id, cancel, system_prompt).await;
    }

    /// Run the loop under the run's wall-clock and finalize the record.
    /// Returns the terminal (status, result, error) triple.
    async fn execute_inner(
        &self,
        run_id: Uuid,
        cancel: CancelToken,
        system_prompt: Option<String>,
    ) -> (SubagentStatus, Option<String>, Option<String>) {
        let (params, timeout_ms) = {
            let mut runs = self.runs.write();
            let Some(run) = runs.get_mut(&run_id) else {
                return (SubagentStatus::Failed, None, Some("run vanished".into()));
            };
            run.advance(SubagentStatus::Running);
            let params = LoopParams {
                task: run.task.clone(),
                system_prompt,
                registry: self.registry.clone(),
                provider: self.provider.clone(),
                filter: ToolFilter::for_subagent(run.allowed_tools.as_deref(), &run.blocked_tools),
                model: run.model.clone(),
                max_tool_calls: self.config.max_tool_calls_per_run,
                token_budget: run.token_budget,
                cancel: cancel.clone(),
            };
            (params, run.timeout_ms)
        };

        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), run_tool_loop(params))
            .await
            .ok();
        self.finalize(run_id, &cancel, outcome).await
    }

    async fn finalize(
        &self,
        run_id: Uuid,
        cancel: &CancelToken,
        outcome: Option<LoopOutcome>,
    ) -> (SubagentStatus, Option<String>, Option<String>) {
        let (status, result, error, loop_data) = match outcome {
            Some(outcome) => {
                let (status, result, error) = match &outcome.end {
                    LoopEnd::Completed(text) => {
                        (SubagentStatus::Succeeded, Some(text.clone()), None)
                    }
                    LoopEnd::Cancelled => (SubagentStatus::Cancelled, None, None),
                    LoopEnd::TokenBudgetExhausted => (
                        SubagentStatus::Failed,
                        None,
                        Some("token_budget_exhausted".to_string()),
                    ),
                    LoopEnd::ToolCallLimit => (
                        SubagentStatus::Failed,
                        None,
                        Some("tool_call_limit_reached".to_string()),
                    ),
                    LoopEnd::ProviderFailed(msg) => {
                        (SubagentStatus::Failed, None, Some(msg.clone()))
                    }
                };
                (status, result, error, Some(outcome))
            }
            // Wall-clock elapsed while the loop was mid-flight.
            None if cancel.is_cancelled() => (SubagentStatus::Cancelled, None, None, None),
            None => (
                SubagentStatus::Failed,
                None,
                Some("timed_out".to_string()),
                None,
            ),
        };

        let snapshot = {
            let mut runs = self.runs.write();
            let Some(run) = runs.get_mut(&run_id) else {
                return (status, result, error);
            };
            if let Some(data) = loop_data {
                run.transcript.extend(data.transcript);
                run.tool_call_count += data.tool_call_count;
                run.input_tokens += data.input_tokens;
                run.output_tokens += data.output_tokens;
            }
            run.result = result.clone();
            run.error = error.clone();
            run.advance(status);
            run.clone()
        };
        self.cancels.lock().remove(&run_id);

        let event_type = match status {
            SubagentStatus::Succeeded => "subagent.succeeded",
            SubagentStatus::Cancelled => "subagent.cancelled",
            _ => "subagent.failed",
        };
        let severity = if status == SubagentStatus::Failed {
            Severity::Medium
        } else {
            Severity::Low
        };
        self.publish_terminal(event_type, severity, &snapshot).await;

        if snapshot.mode == SubagentMode::Async {
            if let Some(announce) = &self.announce {
                announce.announce(&snapshot.channel, &snapshot).await;
            }
        }

        (status, result, error)
    }

    async fn publish_event(
        &self,
        event_type: &str,
        run_id: Uuid,
        user_id: &str,
        channel: &str,
        error: Option<&str>,
    ) {
        let event = Event::new(
            event_type,
            "subagents",
            Severity::Low,
            serde_json::json!({
                "run_id": run_id,
                "user_id": user_id,
                "channel": channel,
                "error": error,
            }),
        );
        if let Err(e) = self.publisher.publish(event).await {
            tracing::warn!(error = %e, event_type, "failed to publish subagent event");
        }
    }

    async fn publish_terminal(&self, event_type: &str, severity: Severity, run: &SubagentRun) {
        let event = Event::new(
            event_type,
            "subagents",
            severity,
            serde_json::json!({
                "run_id": run.id,
                "user_id": run.user_id,
                "channel": run.channel,
                "tool_calls": run.tool_call_count,
                "input_tokens": run.input_tokens,
                "output_tokens": run.output_tokens,
                "error": run.error,
            }),
        );
        if let Err(e) = self.publisher.publish(event).await {
            tracing::warn!(error = %e, event_type, "failed to publish subagent event");
        }
    }
}

struct InsertedRun {
    run_id: Uuid,
    cancel: CancelToken,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
