//! Timezone-aware cron evaluator (5-field: min hour dom month dow).
//!
//! Expressions are parsed once into typed field sets, so malformed
//! entries are rejected at registration rather than silently never
//! matching.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

use coda_domain::{Error, Result};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Field parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldPart {
    Any,
    /// `*/n`
    Step(u32),
    Exact(u32),
    Range(u32, u32),
}

#[derive(Debug, Clone)]
struct Field {
    parts: Vec<FieldPart>,
}

impl Field {
    fn parse(text: &str, min: u32, max: u32) -> Result<Self> {
        let bad = |why: &str| Error::InvalidInput(format!("cron field \"{text}\": {why}"));

        let mut parts = Vec::new();
        for part in text.split(',') {
            if part == "*" {
                parts.push(FieldPart::Any);
            } else if let Some(step) = part.strip_prefix("*/") {
                let n: u32 = step.parse().map_err(|_| bad("bad step"))?;
                if n == 0 {
                    return Err(bad("step of 0"));
                }
                parts.push(FieldPart::Step(n));
            } else if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = lo.parse().map_err(|_| bad("bad range"))?;
                let hi: u32 = hi.parse().map_err(|_| bad("bad range"))?;
                if lo > hi || lo < min || hi > max {
                    return Err(bad("range out of bounds"));
                }
                parts.push(FieldPart::Range(lo, hi));
            } else {
                let n: u32 = part.parse().map_err(|_| bad("not a number"))?;
                if n < min || n > max {
                    return Err(bad("value out of bounds"));
                }
                parts.push(FieldPart::Exact(n));
            }
        }
        if parts.is_empty() {
            return Err(bad("empty"));
        }
        Ok(Self { parts })
    }

    fn matches(&self, value: u32) -> bool {
        self.parts.iter().any(|p| match p {
            FieldPart::Any => true,
            FieldPart::Step(n) => value.is_multiple_of(*n),
            FieldPart::Exact(n) => value == *n,
            FieldPart::Range(lo, hi) => value >= *lo && value <= *hi,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CronExpr
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    raw: String,
    minute: Field,
    hour: Field,
    day: Field,
    month: Field,
    weekday: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::InvalidInput(format!(
                "cron \"{expr}\": expected 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            raw: expr.to_string(),
            minute: Field::parse(fields[0], 0, 59)?,
            hour: Field::parse(fields[1], 0, 23)?,
            day: Field::parse(fields[2], 1, 31)?,
            month: Field::parse(fields[3], 1, 12)?,
            weekday: Field::parse(fields[4], 0, 6)?,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether a local naive datetime matches, second ignored.
    fn matches_naive(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day.matches(dt.day())
            && self.month.matches(dt.month())
            && self.weekday.matches(dt.weekday().num_days_from_sunday())
    }

    /// Whether a UTC instant matches when viewed in `tz`.
    pub fn matches_in(&self, dt: &DateTime<Utc>, tz: chrono_tz::Tz) -> bool {
        self.matches_naive(&dt.with_timezone(&tz).naive_local())
    }

    /// Next occurrence after `after`, evaluated in `tz`, as UTC.
    ///
    /// DST handling: local times inside a spring-forward gap are skipped;
    /// fall-back overlaps resolve to the earliest mapping.
    pub fn next_in(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let mut candidate = local_after + chrono::Duration::seconds(60 - local_after.second() as i64);
        candidate = candidate.with_second(0).unwrap_or(candidate);

        let max_checks = 366 * 24 * 60; // one year of minutes
        for _ in 0..max_checks {
            if self.matches_naive(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc));
                    }
                    chrono::LocalResult::None => {
                        // DST gap: this local minute does not exist.
                    }
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }

    /// Up to `n` upcoming occurrences after `after`.
    pub fn upcoming(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz, n: usize) -> Vec<DateTime<Utc>> {
        let mut results = Vec::with_capacity(n);
        let mut cursor = *after;
        for _ in 0..n {
            match self.next_in(&cursor, tz) {
                Some(next) => {
                    results.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        results
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
