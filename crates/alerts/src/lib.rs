//! Severity-based routing of `alert.*` events to delivery sinks, with
//! quiet-hours suppression, cooldown deduplication, and persisted
//! history.

pub mod formatters;
pub mod history;
pub mod preferences;
pub mod router;
pub mod sinks;

pub use formatters::{format_event, severity_color, RichMessage};
pub use history::{AlertHistoryRow, AlertHistoryStore};
pub use preferences::{NoPreferences, PreferencesProvider, PreferencesStore, UserPreferences};
pub use router::AlertRouter;
pub use sinks::{AlertSink, LogSink};
