//! Key-value storage for client state and cached responses.
//!
//! Upper layers only see the [`KvStore`] trait. Redis backs it when several
//! proxy instances must share counters; a process-local [`MemoryStore`] is
//! the fallback whenever Redis is absent or failing.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Store operation timed out")]
    Timeout,
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage capability shared by the rate limiter, connection limiter,
/// blacklist and response cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, `None` when missing or expired
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Increment a counter. The expiry is only set when the counter is
    /// created, so a window started by the first hit ends `ttl` later.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Increment a counter and push its expiry to `ttl` from now. Used for
    /// gauges such as open connections that must outlive their oldest hit.
    async fn incr_refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Decrement a counter, never below zero
    async fn decr(&self, key: &str) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Short backend name for status output
    fn backend(&self) -> &'static str;
}

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn counter_at(expires_at: Instant) -> Self {
        Self {
            value: "0".to_string(),
            expires_at: Some(expires_at),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    fn counter(&self) -> u64 {
        self.value.parse().unwrap_or(0)
    }
}

/// Process-local store. Entries live in a sharded map; each operation holds
/// the lock of its key's shard, so per-key updates are linearizable without
/// serialising unrelated clients.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, key: &str, ttl: Duration, refresh: bool) -> u64 {
        let now = Instant::now();
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::counter_at(now + ttl));
        if !slot.is_live(now) {
            *slot = Slot::counter_at(now + ttl);
        }
        let next = slot.counter() + 1;
        slot.value = next.to_string();
        if refresh {
            slot.expires_at = Some(now + ttl);
        }
        next
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self.increment(key, ttl, false))
    }

    async fn incr_refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self.increment(key, ttl, true))
    }

    async fn decr(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = if entry.get().is_live(now) {
                    entry.get().counter().saturating_sub(1)
                } else {
                    0
                };
                if next == 0 {
                    entry.remove();
                } else {
                    entry.get_mut().value = next.to_string();
                }
                Ok(next)
            }
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self.slots.get(key).map_or(false, |s| s.is_live(now)))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed store shared by every proxy instance
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

/// Redis expiries are whole seconds; never pass zero.
fn ttl_secs(ttl: Duration) -> usize {
    ttl.as_secs().max(1) as usize
}

impl RedisStore {
    /// Connect to Redis, failing fast when it is not reachable
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(Self { conn, op_timeout })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.set_ex(key, value, ttl_secs(ttl)).await })
            .await
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let count: u64 = conn.incr(key, 1).await?;
            if count == 1 {
                conn.expire::<_, ()>(key, ttl_secs(ttl)).await?;
            }
            Ok(count)
        })
        .await
    }

    async fn incr_refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .incr(key, 1)
                .expire(key, ttl_secs(ttl))
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn decr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let count: i64 = conn.decr(key, 1).await?;
            if count <= 0 {
                conn.del::<_, ()>(key).await?;
                return Ok(0);
            }
            Ok(count as u64)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.exists(key).await }).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.del(key).await }).await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Store that prefers a shared backend and transparently falls back to
/// process-local state when the shared backend fails.
pub struct FallbackStore {
    primary: Option<Arc<dyn KvStore>>,
    local: Arc<MemoryStore>,
}

macro_rules! with_fallback {
    ($self:ident, $op:literal, $key:expr, |$store:ident| $call:expr) => {{
        if let Some($store) = $self.primary.as_deref() {
            match $call.await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} store {} failed for {}: {}, using local state", $store.backend(), $op, $key, e);
                    metrics::increment_counter!("edge_store_fallbacks_total", "op" => $op);
                }
            }
        }
        let $store: &dyn KvStore = $self.local.as_ref();
        $call.await
    }};
}

impl FallbackStore {
    pub fn new(primary: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            primary,
            local: Arc::new(MemoryStore::new()),
        }
    }

    /// Local-only store
    pub fn local() -> Self {
        Self::new(None)
    }

    /// Build the store from configuration. An unreachable Redis is logged
    /// and replaced by local state.
    pub async fn from_config(redis: &crate::models::RedisConfig) -> Self {
        if !redis.enabled {
            info!("Redis disabled, using in-memory client state");
            return Self::local();
        }
        match RedisStore::connect(&redis.url, Duration::from_secs(2)).await {
            Ok(store) => {
                info!("Connected to Redis at {}", redis.url);
                Self::new(Some(Arc::new(store)))
            }
            Err(e) => {
                warn!(
                    "Redis not available at {}: {}. Falling back to in-memory storage (not shared between proxy instances)",
                    redis.url, e
                );
                Self::local()
            }
        }
    }

    /// Reclaim expired local entries
    pub fn sweep(&self) -> usize {
        let removed = self.local.purge_expired();
        if removed > 0 {
            debug!("Swept {} expired local entries", removed);
        }
        removed
    }
}

#[async_trait]
impl KvStore for FallbackStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_fallback!(self, "get", key, |store| store.get(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        with_fallback!(self, "set_ex", key, |store| store.set_ex(key, value, ttl))
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        with_fallback!(self, "incr_ex", key, |store| store.incr_ex(key, ttl))
    }

    async fn incr_refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        with_fallback!(self, "incr_refresh", key, |store| store.incr_refresh(key, ttl))
    }

    async fn decr(&self, key: &str) -> Result<u64, StoreError> {
        with_fallback!(self, "decr", key, |store| store.decr(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        with_fallback!(self, "exists", key, |store| store.exists(key))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        with_fallback!(self, "del", key, |store| store.del(key))
    }

    fn backend(&self) -> &'static str {
        self.primary.as_deref().map_or("memory", |p| p.backend())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counter_window_expires() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_ex("k", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_ex("k", ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.incr_ex("k", ttl).await.unwrap(), 3);

        // expiry is anchored at the first increment
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.incr_ex("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_counter_outlives_first_hit() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert_eq!(store.incr_refresh("c", ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(store.incr_refresh("c", ttl).await.unwrap(), 2);
        assert_eq!(store.decr("c").await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.incr_refresh("c", ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!store.exists("c").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(60);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        store.incr_ex("shared", ttl).await.unwrap();
                        store.incr_refresh("gauge", ttl).await.unwrap();
                    }
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap().as_deref(), Some("800"));
        assert_eq!(store.get("gauge").await.unwrap().as_deref(), Some("800"));
    }

    #[tokio::test]
    async fn decr_never_goes_negative() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);

        store.incr_ex("c", ttl).await.unwrap();
        assert_eq!(store.decr("c").await.unwrap(), 0);
        assert_eq!(store.decr("c").await.unwrap(), 0);
        assert!(!store.exists("c").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_and_sweep() {
        let store = MemoryStore::new();
        store.set_ex("a", "1", Duration::from_secs(5)).await.unwrap();
        store.set_ex("b", "2", Duration::from_secs(50)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fallback_recovers_from_primary_failure() {
        let mut primary = MockKvStore::new();
        primary
            .expect_incr_ex()
            .returning(|_, _| Err(StoreError::Unavailable("connection refused".to_string())));
        primary.expect_backend().return_const("redis");

        let store = FallbackStore::new(Some(Arc::new(primary)));
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_ex("rate_limit:1.2.3.4", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_ex("rate_limit:1.2.3.4", ttl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fallback_prefers_primary() {
        let mut primary = MockKvStore::new();
        primary.expect_exists().times(1).returning(|_| Ok(true));
        primary.expect_backend().return_const("redis");

        let store = FallbackStore::new(Some(Arc::new(primary)));
        assert!(store.exists("blacklist:1.2.3.4").await.unwrap());
        assert_eq!(store.backend(), "redis");
    }
}
