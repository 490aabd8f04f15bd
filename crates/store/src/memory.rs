//! In-process backend with full consumer-group semantics.
//!
//! The default for single-process deployments and the backend every test
//! runs against. State lives for the lifetime of the process; "restart"
//! for a consumer means dropping its loop and starting a new one against
//! the same backend, which is exactly what redelivery tests do.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use coda_domain::{Error, Result};

use crate::backend::{KvBackend, StreamBackend, StreamEntry, WindowSample};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    /// (seq, entry), oldest first.
    entries: VecDeque<(u64, StreamEntry)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Highest seq handed out to any consumer.
    last_delivered: u64,
    /// Entries delivered but not acknowledged, oldest first. Holds a full
    /// clone so redelivery survives stream trimming.
    pending: Vec<PendingEntry>,
}

struct PendingEntry {
    seq: u64,
    consumer: String,
    entry: StreamEntry,
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory implementation of both backend traits.
#[derive(Default)]
pub struct MemoryBackend {
    streams: Mutex<HashMap<String, StreamState>>,
    kv: Mutex<HashMap<String, KvEntry>>,
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_available(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let StreamState { entries, groups, .. } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| Error::Store(format!("no such group: {group}")))?;

        let mut out = Vec::new();
        for (seq, entry) in entries.iter() {
            if out.len() >= count {
                break;
            }
            if *seq > group_state.last_delivered {
                group_state.last_delivered = *seq;
                group_state.pending.push(PendingEntry {
                    seq: *seq,
                    consumer: consumer.to_string(),
                    entry: entry.clone(),
                });
                out.push(entry.clone());
            }
        }
        Ok(out)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();

        state.next_seq += 1;
        let seq = state.next_seq;
        let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);
        let entry = StreamEntry {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        };
        state.entries.push_back((seq, entry));

        if let Some(cap) = maxlen {
            while state.entries.len() as u64 > cap {
                state.entries.pop_front();
            }
        }
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        // Starts at the beginning: entries appended before the group
        // existed are still delivered.
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let streams = self.streams.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(group_state
            .pending
            .iter()
            .filter(|p| p.consumer == consumer)
            .take(count)
            .map(|p| p.entry.clone())
            .collect())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let found = self.read_available(stream, group, consumer, count)?;
            if !found.is_empty() {
                return Ok(found);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let step = (deadline - now).min(Duration::from_millis(10));
            tokio::time::sleep(step).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.retain(|p| p.entry.id != id);
            }
        }
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let streams = self.streams.lock();
        Ok(streams.get(stream).map_or(0, |s| s.entries.len() as u64))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KvBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn ttl_instant(ttl_secs: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(ttl_secs))
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.kv.lock().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl_instant(ttl_secs),
            },
        );
        Ok(())
    }

    async fn set_many_ex(&self, pairs: &[(String, String)], ttl_secs: u64) -> Result<()> {
        let mut kv = self.kv.lock();
        for (key, value) in pairs {
            kv.insert(
                key.clone(),
                KvEntry {
                    value: value.clone(),
                    expires_at: ttl_instant(ttl_secs),
                },
            );
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(existing) if !existing.is_expired() => Ok(false),
            _ => {
                kv.insert(
                    key.to_string(),
                    KvEntry {
                        value: value.to_string(),
                        expires_at: ttl_instant(ttl_secs),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(entry) if entry.is_expired() => {
                kv.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut kv = self.kv.lock();
        Ok(keys
            .iter()
            .map(|key| match kv.get(key) {
                Some(entry) if entry.is_expired() => {
                    kv.remove(key);
                    None
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv.lock().remove(key);
        Ok(())
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<WindowSample> {
        let mut windows = self.windows.lock();
        let hits = windows.entry(key.to_string()).or_default();
        let cutoff = now_ms - window_ms;
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }
        hits.push_back(now_ms);
        Ok(WindowSample {
            count: hits.len() as u32,
            oldest_ms: hits.front().copied(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
