//! Ring-buffered history of recent classified errors.
//!
//! Errors are deduplicated by signature (repeats inside a short window
//! are dropped past a threshold) and their messages are scrubbed of
//! anything credential-shaped before being stored.

use std::collections::{HashMap, VecDeque};

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use regex::Regex;

use coda_domain::{ClassifiedError, ErrorCategory};

const DEFAULT_CAP: usize = 200;
/// Duplicates of one signature tolerated per window before dropping.
const DEDUP_THRESHOLD: usize = 5;
const DEDUP_WINDOW_SECS: i64 = 60;

/// Bounded, deduplicated store of recent classified errors.
pub struct ClassifiedErrorStore {
    ring: Mutex<VecDeque<ClassifiedError>>,
    seen: Mutex<HashMap<String, VecDeque<chrono::DateTime<Utc>>>>,
    cap: usize,
    secret_pattern: Regex,
}

impl Default for ClassifiedErrorStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}

impl ClassifiedErrorStore {
    pub fn new(cap: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashMap::new()),
            cap,
            secret_pattern: Regex::new(
                r"(?i)\b(api[_-]?key|token|secret|password|bearer|authorization)\b\s*[:=]?\s*\S+",
            )
            .expect("static regex"),
        }
    }

    /// Record an error. Returns `false` when it was dropped as a
    /// duplicate.
    pub fn push(&self, mut error: ClassifiedError) -> bool {
        let now = Utc::now();
        let window = Duration::seconds(DEDUP_WINDOW_SECS);

        {
            let mut seen = self.seen.lock();
            let hits = seen.entry(error.signature.clone()).or_default();
            while hits
                .front()
                .is_some_and(|t| now.signed_duration_since(*t) > window)
            {
                hits.pop_front();
            }
            if hits.len() >= DEDUP_THRESHOLD {
                return false;
            }
            hits.push_back(now);
        }

        error.message = self
            .secret_pattern
            .replace_all(&error.message, "$1 [redacted]")
            .into_owned();

        let mut ring = self.ring.lock();
        ring.push_back(error);
        while ring.len() > self.cap {
            ring.pop_front();
        }
        true
    }

    /// Most recent errors, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ClassifiedError> {
        self.ring.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Recent errors of one category, newest first.
    pub fn by_category(&self, category: ErrorCategory, limit: usize) -> Vec<ClassifiedError> {
        self.ring
            .lock()
            .iter()
            .rev()
            .filter(|e| e.category == category)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
