//! Shared error type and the classification taxonomy layered on top of it.
//!
//! Every fallible operation in the core returns [`Result`]. At fault points
//! the error is additionally *classified* into a [`ClassifiedError`] that
//! carries a category, a handling strategy, and a stable signature used to
//! deduplicate repeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared error type used across all Coda crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("disabled: {0}")]
    Disabled(String),

    #[error("recursion blocked: {0}")]
    RecursionBlocked(String),

    #[error("saturated: {0}")]
    Saturated(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("policy: {0}")]
    Policy(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry could plausibly succeed.
    ///
    /// Transient means: connection-level failures (ECONNREFUSED,
    /// ECONNRESET, ETIMEDOUT), HTTP 429, HTTP 5xx, or any timeout.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            // The local limiter already supplies a retry-after hint; an
            // immediate retry would only burn the window further.
            Error::RateLimited { .. } => false,
            other => {
                let msg = other.to_string();
                msg.contains("ECONNREFUSED")
                    || msg.contains("ECONNRESET")
                    || msg.contains("ETIMEDOUT")
                    || msg.to_ascii_lowercase().contains("timeout")
                    || msg.contains("HTTP 429")
                    || http_5xx(&msg)
            }
        }
    }
}

fn http_5xx(msg: &str) -> bool {
    // Matches "HTTP 500".."HTTP 599" without compiling a regex on a hot path.
    msg.match_indices("HTTP 5").any(|(i, _)| {
        msg[i + 6..]
            .as_bytes()
            .get(..2)
            .is_some_and(|rest| rest.iter().all(u8::is_ascii_digit))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthExpired,
    Transient,
    RateLimited,
    MalformedOutput,
    InvalidInput,
    Permanent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    Retry,
    Backoff,
    RefreshCredentials,
    Report,
    Drop,
}

impl ErrorCategory {
    /// Default handling strategy for the category.
    pub fn strategy(self) -> ErrorStrategy {
        match self {
            ErrorCategory::Transient => ErrorStrategy::Retry,
            ErrorCategory::RateLimited => ErrorStrategy::Backoff,
            ErrorCategory::AuthExpired => ErrorStrategy::RefreshCredentials,
            ErrorCategory::MalformedOutput
            | ErrorCategory::InvalidInput
            | ErrorCategory::Permanent
            | ErrorCategory::Unknown => ErrorStrategy::Report,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::AuthExpired => "auth_expired",
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::MalformedOutput => "malformed_output",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Categorize an [`Error`] at a fault point.
pub fn categorize(err: &Error) -> ErrorCategory {
    match err {
        Error::RateLimited { .. } => ErrorCategory::RateLimited,
        Error::Auth(_) => ErrorCategory::AuthExpired,
        Error::Json(_) => ErrorCategory::MalformedOutput,
        Error::InvalidInput(_) | Error::UnknownTool(_) | Error::UnknownSkill(_) => {
            ErrorCategory::InvalidInput
        }
        Error::Policy(_) => ErrorCategory::Permanent,
        other => {
            let msg = other.to_string();
            if msg.contains("HTTP 401") || msg.contains("HTTP 403") {
                ErrorCategory::AuthExpired
            } else if msg.contains("HTTP 429") {
                ErrorCategory::RateLimited
            } else if other.is_transient() {
                ErrorCategory::Transient
            } else {
                ErrorCategory::Unknown
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ClassifiedError
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A classified error as recorded in the error store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub strategy: ErrorStrategy,
    /// Skill or subsystem the error originated from.
    pub source: String,
    /// Sanitized, human-readable message.
    pub message: String,
    /// Stable dedup key: `category:source:` + normalized message prefix.
    pub signature: String,
    pub occurred_at: DateTime<Utc>,
}

impl ClassifiedError {
    /// Classify an error raised by `source`.
    pub fn from_error(source: &str, err: &Error) -> Self {
        let category = categorize(err);
        Self::from_parts(category, source, &err.to_string())
    }

    /// Build a classified error from an already-known category.
    pub fn from_parts(category: ErrorCategory, source: &str, message: &str) -> Self {
        Self {
            category,
            strategy: category.strategy(),
            source: source.to_string(),
            message: message.to_string(),
            signature: build_signature(category, source, message),
            occurred_at: Utc::now(),
        }
    }
}

const SIGNATURE_MAX_LEN: usize = 100;

/// Derive the dedup signature for an error.
///
/// The message portion is normalized so that messages differing only by
/// long numbers (>= 10 digits), hex ids (>= 8 chars), IPv4 addresses, or
/// port suffixes collapse to the same signature.
pub fn build_signature(category: ErrorCategory, source: &str, message: &str) -> String {
    let normalized = normalize_message(message);
    let mut sig = format!("{}:{}:{}", category.as_str(), source, normalized);
    if sig.len() > SIGNATURE_MAX_LEN {
        let mut end = SIGNATURE_MAX_LEN;
        while !sig.is_char_boundary(end) {
            end -= 1;
        }
        sig.truncate(end);
    }
    sig
}

/// Collapse volatile tokens in an error message.
fn normalize_message(message: &str) -> String {
    // Cold path: signatures are built on errors only, so the regexes are
    // compiled inline rather than cached.
    let ip = regex::Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("static regex");
    let hex = regex::Regex::new(r"\b[0-9a-fA-F]{8,}\b").expect("static regex");
    let digits = regex::Regex::new(r"\d{10,}").expect("static regex");
    let port = regex::Regex::new(r":\d{2,5}\b").expect("static regex");

    let msg = ip.replace_all(message, "<ip>");
    let msg = hex.replace_all(&msg, "<id>");
    let msg = digits.replace_all(&msg, "<num>");
    let msg = port.replace_all(&msg, ":<port>");
    msg.into_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
