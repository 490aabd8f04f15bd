//! The consumer loop: pending phase, live phase, and per-message
//! processing with idempotency receipts, retries, and dead-lettering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use coda_domain::cancel::CancelToken;
use coda_domain::{Event, Result, Severity};
use coda_store::StreamEntry;

use crate::bus::{EventBus, EventPublisher, Subscription};

/// Pending-phase batch size.
const PENDING_BATCH: usize = 100;
/// Live-phase blocking read batch size.
const LIVE_BATCH: usize = 10;

fn idem_key(event_id: &str, handler_name: &str) -> String {
    format!("idem:{event_id}:{handler_name}")
}

enum HandlerOutcome {
    Succeeded,
    DeadLettered,
    /// Not finished: the message must stay pending for redelivery.
    Incomplete,
}

/// One consumer within the bus's consumer group.
///
/// Call [`run`](BusConsumer::run) on a dedicated task; stop it through the
/// token from [`cancel_token`](BusConsumer::cancel_token). Restarting a
/// consumer under the same name resumes its pending list.
pub struct BusConsumer {
    bus: Arc<EventBus>,
    consumer_name: String,
    cancel: CancelToken,
    /// Attempts per (message id, handler name). In-memory: a process
    /// restart resets counts, which only means a few extra retries.
    retry_counts: Mutex<HashMap<(String, String), u32>>,
}

impl BusConsumer {
    pub fn new(bus: Arc<EventBus>, consumer_name: impl Into<String>) -> Self {
        Self {
            bus,
            consumer_name: consumer_name.into(),
            cancel: CancelToken::new(),
            retry_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the consumer until cancelled: ensure the group exists, drain
    /// this consumer's pending list, then block-read new messages.
    pub async fn run(&self) -> Result<()> {
        self.bus
            .stream
            .ensure_group(&self.bus.event_stream, &self.bus.config.consumer_group)
            .await?;

        self.drain_pending().await?;

        tracing::info!(consumer = %self.consumer_name, "bus consumer entering live phase");
        while !self.cancel.is_cancelled() {
            let read = self
                .bus
                .stream
                .read_new(
                    &self.bus.event_stream,
                    &self.bus.config.consumer_group,
                    &self.consumer_name,
                    LIVE_BATCH,
                    self.bus.config.block_ms,
                )
                .await;

            match read {
                Ok(entries) if entries.is_empty() => {
                    // Spurious wakeup or idle stream.
                    tokio::task::yield_now().await;
                }
                Ok(entries) => {
                    for entry in entries {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        self.process(&entry).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bus read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::info!(consumer = %self.consumer_name, "bus consumer stopped");
        Ok(())
    }

    /// Pending phase: re-process everything delivered to this consumer
    /// but not acknowledged before the last shutdown.
    pub async fn drain_pending(&self) -> Result<()> {
        self.bus
            .stream
            .ensure_group(&self.bus.event_stream, &self.bus.config.consumer_group)
            .await?;

        loop {
            let entries = self
                .bus
                .stream
                .read_pending(
                    &self.bus.event_stream,
                    &self.bus.config.consumer_group,
                    &self.consumer_name,
                    PENDING_BATCH,
                )
                .await?;
            if entries.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for entry in entries {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                if self.process(&entry).await {
                    progressed = true;
                }
            }
            // A batch where nothing could be acknowledged would loop
            // forever; leave it for the next restart instead.
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Read one batch of new messages without blocking and process it.
    /// Returns how many messages were read.
    pub async fn poll_once(&self) -> Result<usize> {
        self.bus
            .stream
            .ensure_group(&self.bus.event_stream, &self.bus.config.consumer_group)
            .await?;
        let entries = self
            .bus
            .stream
            .read_new(
                &self.bus.event_stream,
                &self.bus.config.consumer_group,
                &self.consumer_name,
                LIVE_BATCH,
                0,
            )
            .await?;
        let count = entries.len();
        for entry in &entries {
            self.process(entry).await;
        }
        Ok(count)
    }

    /// Process and conditionally acknowledge. Returns whether the message
    /// was acknowledged.
    async fn process(&self, entry: &StreamEntry) -> bool {
        let should_ack = self.handle_entry(entry).await;
        if should_ack {
            if let Err(e) = self
                .bus
                .stream
                .ack(
                    &self.bus.event_stream,
                    &self.bus.config.consumer_group,
                    &entry.id,
                )
                .await
            {
                tracing::warn!(error = %e, message_id = %entry.id, "ack failed");
                return false;
            }
        }
        should_ack
    }

    /// Dispatch a message to every matching handler.
    ///
    /// Returns `true` when the message may be acknowledged: every matching
    /// handler either succeeded (now or on a previous delivery) or has
    /// been dead-lettered.
    pub(crate) async fn handle_entry(&self, entry: &StreamEntry) -> bool {
        let Some(data) = entry.field("data") else {
            tracing::warn!(message_id = %entry.id, "message without data field, dropping");
            return true;
        };
        let event: Event = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, message_id = %entry.id, "malformed event, dropping");
                return true;
            }
        };

        let subs = self.bus.matching(&event.event_type);
        if subs.is_empty() {
            return true;
        }

        // One batched lookup for all idempotency receipts.
        let keys: Vec<String> = subs
            .iter()
            .map(|s| idem_key(&event.event_id, &s.handler_name))
            .collect();
        let seen = match self.bus.kv.mget(&keys).await {
            Ok(seen) => seen,
            Err(e) => {
                tracing::warn!(error = %e, "idempotency lookup failed, leaving pending");
                return false;
            }
        };

        let mut receipts: Vec<(String, String)> = Vec::new();
        let mut all_handled = true;

        for ((sub, key), seen) in subs.iter().zip(keys).zip(seen) {
            if seen.is_some() {
                // Already processed on a previous delivery.
                continue;
            }
            match self.run_handler(&event, entry, sub).await {
                HandlerOutcome::Succeeded => receipts.push((key, "1".to_string())),
                HandlerOutcome::DeadLettered => {}
                HandlerOutcome::Incomplete => all_handled = false,
            }
        }

        if !receipts.is_empty() {
            // One batched round-trip for all receipts.
            if let Err(e) = self
                .bus
                .kv
                .set_many_ex(&receipts, self.bus.config.idempotency_key_ttl)
                .await
            {
                tracing::warn!(error = %e, "idempotency receipt flush failed");
            }
        }

        all_handled
    }

    /// Invoke one handler with in-place retries up to the configured cap,
    /// dead-lettering on exhaustion.
    async fn run_handler(
        &self,
        event: &Event,
        entry: &StreamEntry,
        sub: &Subscription,
    ) -> HandlerOutcome {
        let counter_key = (entry.id.clone(), sub.handler_name.clone());
        let mut attempts = *self.retry_counts.lock().get(&counter_key).unwrap_or(&0);

        loop {
            if self.cancel.is_cancelled() {
                self.retry_counts.lock().insert(counter_key, attempts);
                return HandlerOutcome::Incomplete;
            }

            match sub.handler.handle(event).await {
                Ok(()) => {
                    self.retry_counts.lock().remove(&counter_key);
                    return HandlerOutcome::Succeeded;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.bus.config.max_retries {
                        match self.dead_letter(event, entry, sub, &e.to_string()).await {
                            Ok(()) => {
                                self.retry_counts.lock().remove(&counter_key);
                                return HandlerOutcome::DeadLettered;
                            }
                            Err(dl_err) => {
                                tracing::warn!(
                                    error = %dl_err,
                                    handler = %sub.handler_name,
                                    "dead-letter write failed, leaving message pending"
                                );
                                self.retry_counts.lock().insert(counter_key, attempts);
                                return HandlerOutcome::Incomplete;
                            }
                        }
                    }
                    self.retry_counts.lock().insert(counter_key.clone(), attempts);
                    tracing::warn!(
                        error = %e,
                        handler = %sub.handler_name,
                        attempt = attempts,
                        "handler failed, retrying"
                    );
                }
            }
        }
    }

    /// Record an exhausted handler in the dead-letter stream and announce
    /// it on the bus.
    async fn dead_letter(
        &self,
        event: &Event,
        entry: &StreamEntry,
        sub: &Subscription,
        error: &str,
    ) -> Result<()> {
        let original = entry.field("data").unwrap_or_default().to_string();
        self.bus
            .stream
            .append(
                &self.bus.dead_letter_stream,
                &[
                    ("data".to_string(), original),
                    ("error".to_string(), error.to_string()),
                    ("handler".to_string(), sub.handler_name.clone()),
                    ("originalMessageId".to_string(), entry.id.clone()),
                ],
                None,
            )
            .await?;

        tracing::error!(
            event_id = %event.event_id,
            handler = %sub.handler_name,
            error = %error,
            "handler dead-lettered"
        );

        // A dead-letter alert that itself dead-letters would cascade
        // without end; the stream entry above is the durable record.
        if event.event_type != "alert.system.dead_letter" {
            let announce = Event::new(
                "alert.system.dead_letter",
                "bus",
                Severity::High,
                serde_json::json!({
                    "event_id": event.event_id,
                    "event_type": event.event_type,
                    "handler": sub.handler_name,
                    "error": error,
                    "original_message_id": entry.id,
                }),
            );
            if let Err(e) = self.bus.publish(announce).await {
                tracing::warn!(error = %e, "failed to publish dead-letter alert");
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use coda_domain::config::{BusConfig, StoreConfig};
    use coda_domain::Error;
    use coda_store::{MemoryBackend, StreamBackend};

    fn make_bus() -> (Arc<EventBus>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let bus = Arc::new(EventBus::new(
            backend.clone(),
            backend.clone(),
            BusConfig::default(),
            &StoreConfig::default(),
        ));
        (bus, backend)
    }

    fn event(event_type: &str, event_id: &str) -> Event {
        let mut e = Event::new(event_type, "tester", Severity::Low, serde_json::json!({}));
        e.event_id = event_id.to_string();
        e
    }

    async fn read_all(
        backend: &MemoryBackend,
        stream: &str,
        group: &str,
    ) -> Vec<StreamEntry> {
        backend.ensure_group(stream, group).await.unwrap();
        backend.read_new(stream, group, "probe", 100, 0).await.unwrap()
    }

    // ── Dead-letter path ────────────────────────────────────────────

    #[tokio::test]
    async fn failing_handler_is_retried_then_dead_lettered() {
        let (bus, backend) = make_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let handler_name = bus
            .subscribe_fn("alert.*", move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Other("boom".into()))
                }
            })
            .unwrap();

        bus.publish(event("alert.test.x", "e1")).await.unwrap();

        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.poll_once().await.unwrap();

        // Invoked exactly max_retries times.
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // One dead-letter entry with handler name and original message id.
        let dead = read_all(&backend, "coda:events:dead", "probe-group").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].field("handler"), Some(handler_name.as_str()));
        assert_eq!(dead[0].field("error"), Some("boom"));
        assert!(dead[0].field("originalMessageId").is_some());
        assert!(dead[0].field("data").unwrap().contains("\"e1\""));

        // One alert.system.dead_letter event published to the main stream.
        let events = read_all(&backend, "coda:events", "probe-group").await;
        let dead_letter_events: Vec<_> = events
            .iter()
            .filter(|e| {
                e.field("data")
                    .is_some_and(|d| d.contains("alert.system.dead_letter"))
            })
            .collect();
        assert_eq!(dead_letter_events.len(), 1);

        // The original message was acknowledged afterwards.
        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    // ── Idempotent redelivery ───────────────────────────────────────

    #[tokio::test]
    async fn redelivery_after_crash_does_not_rerun_handler() {
        let (bus, backend) = make_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        bus.subscribe_fn("*", move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        bus.publish(event("memory.saved", "e2")).await.unwrap();

        // First delivery: handler runs, receipt commits, but the process
        // "crashes" before the acknowledgment.
        let consumer = BusConsumer::new(bus.clone(), "c1");
        backend.ensure_group("coda:events", "coda").await.unwrap();
        let delivered = backend
            .read_new("coda:events", "coda", "c1", 10, 0)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(consumer.handle_entry(&delivered[0]).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Restart: the pending phase redelivers, the receipt suppresses
        // the handler, and the message is finally acknowledged.
        let restarted = BusConsumer::new(bus.clone(), "c1");
        restarted.drain_pending().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn duplicate_event_id_is_delivered_once_per_handler() {
        let (bus, _) = make_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        bus.subscribe_fn("alert.*", move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        // Two distinct stream messages carrying the same event id.
        bus.publish(event("alert.test.x", "dup")).await.unwrap();
        bus.publish(event("alert.test.x", "dup")).await.unwrap();

        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.poll_once().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── Drop paths ──────────────────────────────────────────────────

    #[tokio::test]
    async fn malformed_payload_is_acked_and_dropped() {
        let (bus, backend) = make_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        bus.subscribe_fn("*", move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        backend
            .append(
                "coda:events",
                &[("data".to_string(), "{not json".to_string())],
                None,
            )
            .await
            .unwrap();

        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.poll_once().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unmatched_event_is_acked() {
        let (bus, backend) = make_bus();
        bus.subscribe_fn("alert.*", |_| async { Ok(()) }).unwrap();

        bus.publish(event("scheduler.task_toggled", "e3")).await.unwrap();

        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.poll_once().await.unwrap();
        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    // ── Retry bookkeeping ───────────────────────────────────────────

    #[tokio::test]
    async fn handler_recovering_within_retry_budget_succeeds() {
        let (bus, backend) = make_bus();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        bus.subscribe_fn("alert.*", move |_| {
            let calls = calls_in.clone();
            async move {
                // Fail the first two attempts, succeed on the third.
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Other("transient".into()))
                } else {
                    Ok(())
                }
            }
        })
        .unwrap();

        bus.publish(event("alert.test.x", "e4")).await.unwrap();
        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.poll_once().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No dead letter was written.
        assert_eq!(
            StreamBackend::len(backend.as_ref(), "coda:events:dead")
                .await
                .unwrap(),
            0
        );
        // And the message was acknowledged.
        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancelled_consumer_leaves_message_pending() {
        let (bus, backend) = make_bus();
        bus.subscribe_fn("alert.*", |_| async { Ok(()) }).unwrap();
        bus.publish(event("alert.test.x", "e5")).await.unwrap();

        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.cancel_token().cancel();

        backend.ensure_group("coda:events", "coda").await.unwrap();
        let delivered = backend
            .read_new("coda:events", "coda", "c1", 10, 0)
            .await
            .unwrap();
        assert!(!consumer.handle_entry(&delivered[0]).await);

        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_of_dead_letter_alert_does_not_cascade() {
        let (bus, backend) = make_bus();
        bus.subscribe_fn("alert.*", |_| async { Err(Error::Other("always".into())) })
            .unwrap();

        bus.publish(event("alert.system.dead_letter", "e6")).await.unwrap();

        let consumer = BusConsumer::new(bus.clone(), "c1");
        consumer.poll_once().await.unwrap();

        // Dead-lettered to the stream, but no new alert event published.
        assert_eq!(
            StreamBackend::len(backend.as_ref(), "coda:events:dead")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            StreamBackend::len(backend.as_ref(), "coda:events").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn run_processes_and_stops_on_cancel() {
        // Short blocking reads so the loop notices cancellation quickly.
        let backend = Arc::new(MemoryBackend::new());
        let bus = Arc::new(EventBus::new(
            backend.clone(),
            backend.clone(),
            BusConfig {
                block_ms: 50,
                ..BusConfig::default()
            },
            &StoreConfig::default(),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        bus.subscribe_fn("alert.*", move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        bus.publish(event("alert.test.x", "e7")).await.unwrap();

        let consumer = Arc::new(BusConsumer::new(bus.clone(), "c1"));
        let cancel = consumer.cancel_token();
        let worker = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        // Wait for the handler to fire, then stop the loop.
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        worker.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let pending = backend
            .read_pending("coda:events", "coda", "c1", 100)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }
}
