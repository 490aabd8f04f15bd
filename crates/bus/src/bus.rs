//! The bus itself: publishing and the subscription registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use coda_domain::config::{BusConfig, StoreConfig};
use coda_domain::event::generate_event_id;
use coda_domain::{Event, Result};
use coda_store::{KvBackend, StreamBackend};

use crate::pattern::Pattern;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler + publisher traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A subscription callback. Handlers must be idempotent: a handler whose
/// idempotency receipt did not commit may run again for the same event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Adapter so plain async closures can subscribe.
struct FnHandler {
    f: Box<dyn Fn(Event) -> HandlerFuture + Send + Sync>,
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// The publishing half of the bus, used by components that emit events
/// but never consume them (confirmation manager, scheduler, subagents).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event, returning its (possibly freshly assigned) id.
    async fn publish(&self, event: Event) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One registered (pattern, handler) pair.
///
/// `handler_name` is `pattern + ":" + ordinal` and doubles as the
/// idempotency key suffix, so it must stay stable across restarts for a
/// given registration order.
pub struct Subscription {
    pub(crate) pattern: Pattern,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub handler_name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventBus {
    pub(crate) stream: Arc<dyn StreamBackend>,
    pub(crate) kv: Arc<dyn KvBackend>,
    pub(crate) config: BusConfig,
    pub(crate) event_stream: String,
    pub(crate) dead_letter_stream: String,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl EventBus {
    pub fn new(
        stream: Arc<dyn StreamBackend>,
        kv: Arc<dyn KvBackend>,
        bus_config: BusConfig,
        store_config: &StoreConfig,
    ) -> Self {
        Self {
            stream,
            kv,
            config: bus_config,
            event_stream: store_config.event_stream.clone(),
            dead_letter_stream: store_config.dead_letter_stream.clone(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for an event-type pattern. Returns the stable
    /// handler name.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<String> {
        let compiled = Pattern::compile(pattern)?;
        let mut subs = self.subscriptions.write();
        let handler_name = format!("{}:{}", pattern, subs.len());
        subs.push(Arc::new(Subscription {
            pattern: compiled,
            handler,
            handler_name: handler_name.clone(),
        }));
        Ok(handler_name)
    }

    /// Convenience: subscribe a plain async closure.
    pub fn subscribe_fn<F, Fut>(&self, pattern: &str, f: F) -> Result<String>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(
            pattern,
            Arc::new(FnHandler {
                f: Box::new(move |event| Box::pin(f(event))),
            }),
        )
    }

    /// Subscriptions matching an event type, in registration order.
    pub(crate) fn matching(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.pattern.matches(event_type))
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, mut event: Event) -> Result<String> {
        if event.event_id.is_empty() {
            event.event_id = generate_event_id();
        }
        let json = serde_json::to_string(&event)?;
        self.stream
            .append(
                &self.event_stream,
                &[("data".to_string(), json)],
                Some(self.config.event_stream_max_len),
            )
            .await?;
        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "published event"
        );
        Ok(event.event_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CollectingPublisher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A publisher that records events instead of appending to a stream.
/// Used wherever a component under test publishes side-effect events.
#[derive(Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<Event>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventPublisher for CollectingPublisher {
    async fn publish(&self, mut event: Event) -> Result<String> {
        if event.event_id.is_empty() {
            event.event_id = generate_event_id();
        }
        let id = event.event_id.clone();
        self.events.lock().push(event);
        Ok(id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use coda_domain::Severity;
    use coda_store::MemoryBackend;

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

    #[tokio::test]
    async fn publish_assigns_missing_event_id() {
        let (bus, backend) = make_bus();
        let mut event = Event::new("memory.saved", "memory", Severity::Low, serde_json::json!({}));
        event.event_id.clear();

        let id = bus.publish(event).await.unwrap();
        assert_eq!(id.len(), 26);
        assert_eq!(
            coda_store::StreamBackend::len(backend.as_ref(), "coda:events")
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn publish_preserves_existing_event_id() {
        let (bus, _) = make_bus();
        let mut event = Event::new("memory.saved", "memory", Severity::Low, serde_json::json!({}));
        event.event_id = "01ARZ3NDEKTSV4RRFFQ69G5FAV".into();
        let id = bus.publish(event).await.unwrap();
        assert_eq!(id, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
    }

    #[tokio::test]
    async fn handler_names_use_registration_ordinal() {
        let (bus, _) = make_bus();
        let a = bus.subscribe_fn("alert.*", |_| async { Ok(()) }).unwrap();
        let b = bus.subscribe_fn("alert.*", |_| async { Ok(()) }).unwrap();
        assert_eq!(a, "alert.*:0");
        assert_eq!(b, "alert.*:1");
    }

    #[tokio::test]
    async fn matching_respects_registration_order() {
        let (bus, _) = make_bus();
        bus.subscribe_fn("alert.*", |_| async { Ok(()) }).unwrap();
        bus.subscribe_fn("subagent.*", |_| async { Ok(()) }).unwrap();
        bus.subscribe_fn("alert.email.*", |_| async { Ok(()) }).unwrap();

        let matched = bus.matching("alert.email.urgent");
        let names: Vec<_> = matched.iter().map(|s| s.handler_name.as_str()).collect();
        assert_eq!(names, vec!["alert.*:0", "alert.email.*:2"]);
    }

    #[tokio::test]
    async fn collecting_publisher_records() {
        let publisher = CollectingPublisher::new();
        publisher
            .publish(Event::new("alert.system.abuse", "confirm", Severity::High, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(publisher.count_of("alert.system.abuse"), 1);
        assert_eq!(publisher.count_of("other"), 0);
    }
}
