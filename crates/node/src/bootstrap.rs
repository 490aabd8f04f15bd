//! Service wiring: construct the backends and core services, start the
//! background loops, and shut them down cleanly on ctrl-c.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use coda_alerts::{AlertHistoryStore, AlertRouter, LogSink, PreferencesStore};
use coda_bus::{BusConsumer, EventBus};
use coda_domain::cancel::CancelToken;
use coda_domain::config::{Config, StoreBackendKind};
use coda_providers::UnconfiguredProvider;
use coda_scheduler::TaskScheduler;
use coda_skills::{ClassifiedErrorStore, HealthTracker, SkillRegistry};
use coda_store::{KvBackend, MemoryBackend, RedisBackend, StreamBackend};
use coda_subagents::SubagentManager;

/// Interval of the skill recovery prober.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);
/// Interval of the idle-resource sweep across skills.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Read the TOML config, or fall back to defaults when the file does not
/// exist.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    // ── Backends ─────────────────────────────────────────────────────
    let (stream, kv): (Arc<dyn StreamBackend>, Arc<dyn KvBackend>) = match config.store.backend {
        StoreBackendKind::Memory => {
            let backend = Arc::new(MemoryBackend::new());
            (backend.clone(), backend)
        }
        StoreBackendKind::Redis => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .context("redis backend without redis_url")?;
            let backend = Arc::new(RedisBackend::connect(url).await?);
            tracing::info!("connected to redis store");
            (backend.clone(), backend)
        }
    };

    // ── Core services ────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new(
        stream,
        kv.clone(),
        config.bus.clone(),
        &config.store,
    ));

    let health = Arc::new(HealthTracker::new(config.health.clone()));
    let errors = Arc::new(ClassifiedErrorStore::default());
    let registry = Arc::new(SkillRegistry::new(health.clone(), errors));

    let history = Arc::new(AlertHistoryStore::open(
        config.data_dir.join("alert_history.jsonl"),
    ));
    let preferences = Arc::new(PreferencesStore::open(
        config.data_dir.join("user_preferences.jsonl"),
    ));
    let router = Arc::new(AlertRouter::new(
        config.alerts.clone(),
        kv.clone(),
        history,
        preferences,
        None,
    ));
    router.register_sink(Arc::new(LogSink));
    router.attach(&bus)?;

    let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), bus.clone()));

    // The platform plugs a real provider adapter in here; without one,
    // subagent runs fail gracefully at the first model call.
    let subagents = Arc::new(SubagentManager::new(
        config.subagents.clone(),
        registry.clone(),
        Arc::new(UnconfiguredProvider),
        bus.clone(),
        kv.clone(),
        config.data_dir.join("subagent_runs.jsonl"),
        None,
    ));

    // ── Background loops ─────────────────────────────────────────────
    let consumer_name = format!("{}-consumer", config.bus.consumer_group);
    let consumer = Arc::new(BusConsumer::new(bus.clone(), consumer_name));
    let consumer_cancel = consumer.cancel_token();
    let consumer_handle = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer.run().await {
                tracing::error!(error = %e, "bus consumer exited with error");
            }
        })
    };

    let scheduler_cancel = scheduler.cancel_token();
    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });
    }

    let subagents_cancel = subagents.shutdown_token();
    {
        let subagents = subagents.clone();
        tokio::spawn(async move { subagents.run_cleanup_loop().await });
    }

    let probe_cancel = CancelToken::new();
    {
        let health = health.clone();
        let cancel = probe_cancel.clone();
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                tokio::time::sleep(PROBE_INTERVAL).await;
                for skill in health.probe_tick() {
                    tracing::info!(skill = %skill, "skill eligible for recovery probe");
                }
            }
        });
    }

    let sweep_cancel = CancelToken::new();
    {
        let registry = registry.clone();
        let cancel = sweep_cancel.clone();
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
                registry.sweep_idle().await;
            }
        });
    }

    tracing::info!("coda node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    // ── Shutdown ─────────────────────────────────────────────────────
    tracing::info!("shutting down");
    consumer_cancel.cancel();
    scheduler_cancel.cancel();
    subagents_cancel.cancel();
    probe_cancel.cancel();
    sweep_cancel.cancel();
    registry.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(10), consumer_handle)
        .await
        .is_err()
    {
        tracing::warn!("bus consumer did not stop in time");
    }
    Ok(())
}
