//! The task scheduler: named cron tasks, a minute ticker, config
//! overrides, and per-skill client views.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use coda_bus::EventPublisher;
use coda_domain::cancel::CancelToken;
use coda_domain::config::SchedulerConfig;
use coda_domain::{Error, Event, Result, Severity};

use crate::cron::{parse_tz, CronExpr};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler + spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A scheduled task body. Handlers should finish quickly; long work
/// belongs behind an event published to the bus.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self) -> Result<()>;
}

type TaskFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

struct FnTask {
    f: Box<dyn Fn() -> TaskFuture + Send + Sync>,
}

#[async_trait]
impl TaskHandler for FnTask {
    async fn run(&self) -> Result<()> {
        (self.f)().await
    }
}

/// Registration input for one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub description: String,
}

/// Introspection view of a registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub description: String,
    pub next_run: Option<DateTime<Utc>>,
}

struct ScheduledTask {
    spec: TaskSpec,
    expr: CronExpr,
    handler: Arc<dyn TaskHandler>,
    /// Minute-of-epoch this task last fired in, to guard against a tick
    /// landing twice inside the same cron minute.
    last_fired_minute: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TaskScheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskScheduler {
    config: SchedulerConfig,
    tz: chrono_tz::Tz,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    publisher: Arc<dyn EventPublisher>,
    cancel: CancelToken,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, publisher: Arc<dyn EventPublisher>) -> Self {
        let tz = parse_tz(&config.timezone);
        Self {
            config,
            tz,
            tasks: RwLock::new(HashMap::new()),
            publisher,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Register a task. Config overrides for the task's full name replace
    /// its cron expression and enablement before anything is stored.
    pub fn register(&self, mut spec: TaskSpec, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if let Some(overrides) = self.config.tasks.get(&spec.name) {
            if let Some(cron) = &overrides.cron {
                spec.cron = cron.clone();
            }
            if let Some(enabled) = overrides.enabled {
                spec.enabled = enabled;
            }
        }

        let expr = CronExpr::parse(&spec.cron)?;
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&spec.name) {
            return Err(Error::InvalidInput(format!(
                "task \"{}\" already registered",
                spec.name
            )));
        }
        tracing::info!(task = %spec.name, cron = %spec.cron, enabled = spec.enabled, "task registered");
        tasks.insert(
            spec.name.clone(),
            ScheduledTask {
                spec,
                expr,
                handler,
                last_fired_minute: None,
            },
        );
        Ok(())
    }

    /// Convenience: register a plain async closure.
    pub fn register_fn<F, Fut>(&self, spec: TaskSpec, f: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register(
            spec,
            Arc::new(FnTask {
                f: Box::new(move || Box::pin(f())),
            }),
        )
    }

    /// Enable or disable a task. Publishes `scheduler.task_toggled` with
    /// the previous and current state. Returns the previous state.
    pub async fn toggle(&self, name: &str, enabled: bool) -> Result<bool> {
        let previous = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown task \"{name}\"")))?;
            let previous = task.spec.enabled;
            task.spec.enabled = enabled;
            previous
        };

        let event = Event::new(
            "scheduler.task_toggled",
            "scheduler",
            Severity::Low,
            serde_json::json!({
                "task": name,
                "previous": previous,
                "current": enabled,
            }),
        );
        if let Err(e) = self.publisher.publish(event).await {
            tracing::warn!(error = %e, task = name, "failed to publish toggle event");
        }
        Ok(previous)
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.tasks.read().get(name).map(|t| t.spec.enabled)
    }

    /// All registered tasks with their next run times, sorted by name.
    pub fn list(&self) -> Vec<TaskInfo> {
        let now = Utc::now();
        let mut infos: Vec<TaskInfo> = self
            .tasks
            .read()
            .values()
            .map(|t| TaskInfo {
                name: t.spec.name.clone(),
                cron: t.spec.cron.clone(),
                enabled: t.spec.enabled,
                description: t.spec.description.clone(),
                next_run: t.expr.next_in(&now, self.tz),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Upcoming fire times for one task.
    pub fn upcoming(&self, name: &str, n: usize) -> Vec<DateTime<Utc>> {
        let now = Utc::now();
        self.tasks
            .read()
            .get(name)
            .map(|t| t.expr.upcoming(&now, self.tz, n))
            .unwrap_or_default()
    }

    /// Evaluate and run everything due at `now`. Returns how many tasks
    /// fired. Handler failures are logged and do not affect other tasks.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let minute = now.timestamp() / 60;
        let due: Vec<(String, Arc<dyn TaskHandler>)> = {
            let mut tasks = self.tasks.write();
            tasks
                .values_mut()
                .filter(|t| {
                    t.spec.enabled
                        && t.last_fired_minute != Some(minute)
                        && t.expr.matches_in(&now, self.tz)
                })
                .map(|t| {
                    t.last_fired_minute = Some(minute);
                    (t.spec.name.clone(), t.handler.clone())
                })
                .collect()
        };

        for (name, handler) in &due {
            tracing::debug!(task = %name, "running scheduled task");
            if let Err(e) = handler.run().await {
                tracing::warn!(task = %name, error = %e, "scheduled task failed");
            }
        }
        due.len()
    }

    /// Run the dispatch loop until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.config.tick_seconds.max(1));
        tracing::info!(tick_seconds = self.config.tick_seconds, "scheduler started");
        while !self.cancel.is_cancelled() {
            self.tick(Utc::now()).await;
            tokio::time::sleep(interval).await;
        }
        tracing::info!("scheduler stopped");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SchedulerClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The scheduler as one skill sees it: every task name is prefixed with
/// the skill's own name, so skills cannot collide with (or toggle) each
/// other's tasks.
#[derive(Clone)]
pub struct SchedulerClient {
    scheduler: Arc<TaskScheduler>,
    skill: String,
}

impl TaskScheduler {
    /// Build the client view for one skill.
    pub fn client_for(self: &Arc<Self>, skill: &str) -> SchedulerClient {
        SchedulerClient {
            scheduler: self.clone(),
            skill: skill.to_string(),
        }
    }
}

impl SchedulerClient {
    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.skill, name)
    }

    /// Register a task under this skill's namespace. Returns the full
    /// task name.
    pub fn register(&self, mut spec: TaskSpec, handler: Arc<dyn TaskHandler>) -> Result<String> {
        spec.name = self.qualified(&spec.name);
        let full = spec.name.clone();
        self.scheduler.register(spec, handler)?;
        Ok(full)
    }

    pub fn register_fn<F, Fut>(&self, mut spec: TaskSpec, f: F) -> Result<String>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        spec.name = self.qualified(&spec.name);
        let full = spec.name.clone();
        self.scheduler.register_fn(spec, f)?;
        Ok(full)
    }

    pub async fn toggle(&self, name: &str, enabled: bool) -> Result<bool> {
        self.scheduler.toggle(&self.qualified(name), enabled).await
    }

    pub fn upcoming(&self, name: &str, n: usize) -> Vec<DateTime<Utc>> {
        self.scheduler.upcoming(&self.qualified(name), n)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
