//! Search counters held in the external cache store
//!
//! Key families:
//! - `s:<uid>` successful searches this month
//! - `c:<uid>` in-flight searches of one account (TTL bounded)
//! - `q:<priority>` in-flight searches of one priority tier (TTL bounded)
//!
//! The store only needs GET, SET, DEL, MGET, INCR, DECR, EXPIRE and KEYS.
//! Counters never hold a negative value: a decrement that lands below zero
//! deletes the key instead.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::FromRedisValue;
use sola_common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Minimal key-value protocol of the counter cache
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>>;
    async fn set(&self, key: &str, value: i64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;
    /// Keys matching a glob; only `*` wildcards are used by callers
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Redis-backed counter store with a deadline on every command
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisCounterStore {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Cache(e.to_string()))?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::timeout("redis connect", timeout))?
            .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(Self { conn, timeout })
    }

    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd, operation: &str) -> Result<T> {
        let mut conn = self.conn.clone();
        match tokio::time::timeout(self.timeout, cmd.query_async(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Cache(format!("{}: {}", operation, e))),
            Err(_) => Err(Error::timeout(operation, self.timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.run(redis::cmd("GET").arg(key).clone(), "GET").await
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.run(redis::cmd("SET").arg(key).arg(value).clone(), "SET").await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: i64 = self.run(redis::cmd("DEL").arg(key).clone(), "DEL").await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run(redis::cmd("MGET").arg(keys.to_vec()).clone(), "MGET").await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.run(redis::cmd("INCR").arg(key).clone(), "INCR").await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.run(redis::cmd("DECR").arg(key).clone(), "DECR").await
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let _: i64 = self
            .run(redis::cmd("EXPIRE").arg(key).arg(seconds).clone(), "EXPIRE")
            .await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.run(redis::cmd("KEYS").arg(pattern).clone(), "KEYS").await
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process counter store with Redis semantics (single node, tests)
#[derive(Default, Clone)]
pub struct MemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Cache("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries, now))
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: 0,
                expires_at: None,
            });
            entry.value += delta;
            entry.value
        })
    }
}

fn glob_matches(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.with_entries(|entries, _| entries.get(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: None,
                },
            );
        })
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.with_entries(|entries, _| {
            entries.remove(key);
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        self.with_entries(|entries, _| {
            keys.iter()
                .map(|k| entries.get(k).map(|e| e.value))
                .collect()
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.add(key, -1)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        self.with_entries(|entries, now| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
            }
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.with_entries(|entries, _| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_matches(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            keys
        })
    }
}

/// Typed access to the three counter families
#[derive(Clone)]
pub struct Counters {
    store: Arc<dyn CounterStore>,
    ttl_secs: u64,
}

impl Counters {
    pub fn new(store: Arc<dyn CounterStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub fn monthly_key(uid: &str) -> String {
        format!("s:{}", uid)
    }

    pub fn concurrency_key(uid: &str) -> String {
        format!("c:{}", uid)
    }

    pub fn priority_key(priority: i64) -> String {
        format!("q:{}", priority)
    }

    /// INCR then refresh the TTL; returns the post-increment value
    ///
    /// An error means the counter is not held: a failed EXPIRE undoes the
    /// INCR before returning.
    pub async fn increment(&self, key: &str) -> Result<i64> {
        let value = self.store.incr(key).await?;
        if let Err(e) = self.store.expire(key, self.ttl_secs).await {
            if let Err(undo) = self.decrement_floor0(key).await {
                warn!(key, "Failed to undo increment: {}", undo);
            }
            return Err(e);
        }
        Ok(value)
    }

    /// DECR, deleting the key when the result would be negative
    pub async fn decrement_floor0(&self, key: &str) -> Result<i64> {
        let value = self.store.decr(key).await?;
        if value < 0 {
            self.store.del(key).await?;
            return Ok(0);
        }
        Ok(value)
    }

    pub async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.store.get(key).await
    }

    /// Overwrite the monthly count, expiring it when the month rolls over
    pub async fn set_monthly(&self, uid: &str, count: i64, expires_in_secs: u64) -> Result<()> {
        let key = Self::monthly_key(uid);
        self.store.set(&key, count).await?;
        self.store.expire(&key, expires_in_secs).await
    }

    /// In-flight searches summed over every tier at or above `priority`
    pub async fn priority_backlog(&self, priority: i64) -> Result<i64> {
        let keys: Vec<String> = self
            .store
            .keys("q:*")
            .await?
            .into_iter()
            .filter(|key| {
                key.strip_prefix("q:")
                    .and_then(|tier| tier.parse::<i64>().ok())
                    .map_or(false, |tier| tier >= priority)
            })
            .collect();

        let values = self.store.mget(&keys).await?;
        Ok(values.into_iter().flatten().sum())
    }
}
