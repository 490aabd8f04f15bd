//! Publish/subscribe event bus over the stream log.
//!
//! Publishing appends the serialized event to a capped stream; a consumer
//! loop delivers each event to every matching subscription with
//! at-least-once semantics. Exactly-once *effect* is delegated to
//! idempotency receipts keyed per (event, handler); handlers whose
//! retries are exhausted are dead-lettered.

pub mod bus;
pub mod consumer;
pub mod pattern;

pub use bus::{CollectingPublisher, EventBus, EventHandler, EventPublisher, Subscription};
pub use consumer::BusConsumer;
pub use pattern::Pattern;
