//! Wildcard patterns for event-type subscriptions.
//!
//! A pattern is a literal dotted string with optional `*` wildcards. The
//! literal portions are regex-escaped before the wildcard is expanded, so
//! metacharacters in an event type can never change the match.

use regex::Regex;

use coda_domain::{Error, Result};

/// A compiled subscription pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern where `*` matches any run of characters.
    ///
    /// `alert.*` therefore matches `alert.email.urgent` as well as
    /// `alert.system`, which is what alert routing relies on.
    pub fn compile(pattern: &str) -> Result<Self> {
        Self::compile_with_separator(pattern, None)
    }

    /// Compile a pattern where `*` stops at the given separator, e.g.
    /// `Some('.')` makes `*` match a single dotted segment.
    pub fn compile_with_separator(pattern: &str, separator: Option<char>) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidInput("empty subscription pattern".into()));
        }
        let wildcard = match separator {
            Some(sep) => format!("[^{}]*", regex::escape(&sep.to_string())),
            None => ".*".to_string(),
        };

        let mut expr = String::from("^");
        for (i, literal) in pattern.split('*').enumerate() {
            if i > 0 {
                expr.push_str(&wildcard);
            }
            expr.push_str(&regex::escape(literal));
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| Error::InvalidInput(format!("bad pattern \"{pattern}\": {e}")))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.regex.is_match(event_type)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}
