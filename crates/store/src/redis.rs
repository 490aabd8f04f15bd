//! Redis-backed store: streams map onto XADD/XREADGROUP/XACK, the key
//! namespaces onto SET EX / SET NX EX, and the sliding window onto a
//! sorted set trimmed by score.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use coda_domain::{Error, Result};

use crate::backend::{KvBackend, StreamBackend, StreamEntry, WindowSample};

fn store_err(e: redis::RedisError) -> Error {
    Error::Store(e.to_string())
}

/// Shared-store backend over a single Redis connection manager.
///
/// The manager reconnects on its own; individual command failures surface
/// as [`Error::Store`] and are handled by callers (the bus consumer backs
/// off and retries).
pub struct RedisBackend {
    manager: ConnectionManager,
    /// Disambiguates sliding-window members recorded in the same millisecond.
    window_seq: AtomicU64,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let manager = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self {
            manager,
            window_seq: AtomicU64::new(0),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn entries_from_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let mut fields = HashMap::new();
            for (name, value) in id.map {
                if let Ok(text) = redis::from_redis_value::<String>(&value) {
                    fields.insert(name, text);
                }
            }
            out.push(StreamEntry { id: id.id, fields });
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> Result<String> {
        let mut conn = self.conn();
        let id: String = match maxlen {
            Some(cap) => conn
                .xadd_maxlen(stream, StreamMaxlen::Approx(cap as usize), "*", fields)
                .await
                .map_err(store_err)?,
            None => conn.xadd(stream, "*", fields).await.map_err(store_err)?,
        };
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn();
        let created: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(_) => Ok(()),
            // Someone else created it first; that is fine.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // Reading from id 0 returns this consumer's pending entries.
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &["0"], &opts)
            .await
            .map_err(store_err)?;
        Ok(entries_from_reply(reply))
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(store_err)?;
        Ok(entries_from_reply(reply))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: u64 = conn.xack(stream, group, &[id]).await.map_err(store_err)?;
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn();
        conn.xlen(stream).await.map_err(store_err)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KvBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl KvBackend for RedisBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_many_ex(&self, pairs: &[(String, String)], ttl_secs: u64) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for (key, value) in pairs {
            pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(store_err)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async(&mut conn).await.map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: u64 = conn.del(key).await.map_err(store_err)?;
        Ok(())
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<WindowSample> {
        let mut conn = self.conn();
        let cutoff = now_ms - window_ms;
        let seq = self.window_seq.fetch_add(1, Ordering::Relaxed);
        let member = format!("{now_ms}-{seq}");

        let _: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        let _: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(&member)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        let oldest: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        // Keep the set from outliving an idle window.
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(window_ms / 1000 + 1)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(WindowSample {
            count: count as u32,
            oldest_ms: oldest.first().map(|(_, score)| *score),
        })
    }
}
