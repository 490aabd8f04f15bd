//! Shared domain types for the Coda core: events, errors and their
//! classification, tool metadata, content sanitization, cancellation
//! tokens, and the configuration surface.

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod sanitize;
pub mod tool;

pub use error::{ClassifiedError, Error, ErrorCategory, ErrorStrategy, Result};
pub use event::{Event, Severity};
