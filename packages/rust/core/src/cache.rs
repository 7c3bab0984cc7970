//! Enrichment cache: one extraction result per entity, fresh for 24 hours.
//!
//! The cache never raises on reads. A backend that errors or exceeds its
//! operation timeout is treated as a miss, and the failure is counted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use councilgen_shared::{
    CacheBackendKind, CacheConfig, CouncilgenError, ENRICHMENT_TTL, EnrichmentRecord, FieldMap,
    Result,
};
use councilgen_storage::Storage;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(by) = chrono::Duration::from_std(by) {
            *self.now.lock().unwrap_or_else(|p| p.into_inner()) += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Key/value store with per-key expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Remaining lifetime of a live key.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
    fn name(&self) -> &str;
}

/// Process-local backend. Expired entries are dropped on access.
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn live_entry(&self, key: &str) -> Option<(String, DateTime<Utc>)> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                entries.remove(key);
                None
            }
            other => other.cloned(),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_entry(key).map(|(value, _)| value))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + to_chrono(ttl)?;
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.live_entry(key).is_some();
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        Ok(self
            .live_entry(key)
            .and_then(|(_, expires_at)| (expires_at - now).to_std().ok()))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// libSQL-backed backend; survives restarts.
pub struct SqlCacheBackend {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl SqlCacheBackend {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Open (or create) the database and drop already-expired rows.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let storage = Storage::open(path).await?;
        let purged = storage.purge_expired(clock.now()).await?;
        debug!(path = %path.display(), purged, "opened sqlite cache");
        Ok(Self::new(storage, clock))
    }
}

#[async_trait]
impl CacheBackend for SqlCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .storage
            .get_cache_entry(key, self.clock.now())
            .await?
            .map(|entry| entry.value))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        self.storage
            .set_cache_entry(key, value, now, now + to_chrono(ttl)?)
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.storage.delete_cache_entry(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        Ok(self
            .storage
            .cache_expiry(key, now)
            .await?
            .and_then(|expires_at| (expires_at - now).to_std().ok()))
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisCacheBackend;

#[cfg(feature = "redis")]
mod redis_backend {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::AsyncCommands;

    use councilgen_shared::{CouncilgenError, Result};

    use super::CacheBackend;

    fn redis_err(e: redis::RedisError) -> CouncilgenError {
        CouncilgenError::Storage(format!("redis: {e}"))
    }

    /// Shared Redis backend; expiry is enforced by the server.
    pub struct RedisCacheBackend {
        client: redis::Client,
    }

    impl RedisCacheBackend {
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(redis_err)?;
            Ok(Self { client })
        }

        async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(redis_err)
        }
    }

    #[async_trait]
    impl CacheBackend for RedisCacheBackend {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn().await?;
            conn.get(key).await.map_err(redis_err)
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            let mut conn = self.conn().await?;
            let _: () = conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(redis_err)?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            let mut conn = self.conn().await?;
            let removed: i64 = conn.del(key).await.map_err(redis_err)?;
            Ok(removed > 0)
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            let mut conn = self.conn().await?;
            // -2: missing key, -1: no expiry
            let ms: i64 = conn.pttl(key).await.map_err(redis_err)?;
            Ok((ms > 0).then(|| Duration::from_millis(ms as u64)))
        }

        fn name(&self) -> &str {
            "redis"
        }
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| CouncilgenError::validation(format!("ttl out of range: {e}")))
}

// ---------------------------------------------------------------------------
// EnrichmentCache
// ---------------------------------------------------------------------------

/// Counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Namespaced view over a [`CacheBackend`] storing [`EnrichmentRecord`]s.
#[derive(Clone)]
pub struct EnrichmentCache {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    clock: Arc<dyn Clock>,
    op_timeout: Duration,
    counters: Arc<Counters>,
}

impl EnrichmentCache {
    pub fn new(backend: Arc<dyn CacheBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            clock: Arc::new(SystemClock),
            op_timeout: Duration::from_millis(500),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Build the backend named in config.
    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCacheBackend::new(clock.clone())),
            CacheBackendKind::Sqlite => {
                Arc::new(SqlCacheBackend::open(Path::new(&config.sqlite_path), clock.clone()).await?)
            }
            #[cfg(feature = "redis")]
            CacheBackendKind::Redis => Arc::new(RedisCacheBackend::new(&config.redis_url)?),
            #[cfg(not(feature = "redis"))]
            CacheBackendKind::Redis => {
                return Err(CouncilgenError::config(
                    "cache.backend = \"redis\" requires the `redis` feature",
                ));
            }
        };
        info!(backend = backend.name(), namespace = %config.namespace, "enrichment cache ready");

        Ok(Self::new(backend, config.namespace.clone())
            .with_clock(clock)
            .with_op_timeout(Duration::from_millis(config.op_timeout_ms)))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// `<namespace>:<entity_id>`
    pub fn key(&self, entity_id: &str) -> String {
        format!("{}:{entity_id}", self.namespace)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Fresh record for `entity_id`, or `None` on miss, expiry or any
    /// backend failure.
    pub async fn get(&self, entity_id: &str) -> Option<EnrichmentRecord> {
        let key = self.key(entity_id);
        let raw = match self.bounded(self.backend.get(&key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str::<EnrichmentRecord>(&raw) {
            Ok(record) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "cache hit");
                Some(record)
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "unreadable cache record, treating as miss");
                None
            }
        }
    }

    /// Store fields for `entity_id` with the fixed enrichment TTL.
    pub async fn set(&self, entity_id: &str, fields: &FieldMap) -> Result<EnrichmentRecord> {
        let record = EnrichmentRecord {
            entity_id: entity_id.to_string(),
            fields: fields.clone(),
            cached_at: self.clock.now(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| CouncilgenError::parse(format!("cache record: {e}")))?;

        let key = self.key(entity_id);
        self.bounded(self.backend.set_with_ttl(&key, &value, ENRICHMENT_TTL))
            .await
            .inspect_err(|_| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        Ok(record)
    }

    /// Drop the record. `false` when there was none or the backend failed.
    pub async fn invalidate(&self, entity_id: &str) -> bool {
        let key = self.key(entity_id);
        match self.bounded(self.backend.delete(&key)).await {
            Ok(removed) => removed,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "cache invalidate failed");
                false
            }
        }
    }

    /// Time left on the record. `None` on miss or backend failure.
    pub async fn remaining_ttl(&self, entity_id: &str) -> Option<Duration> {
        let key = self.key(entity_id);
        match self.bounded(self.backend.ttl(&key)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "cache ttl query failed");
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| {
                CouncilgenError::Storage(format!(
                    "{} backend timed out after {}ms",
                    self.backend.name(),
                    self.op_timeout.as_millis()
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fields() -> FieldMap {
        FieldMap::from([
            ("planning_email".to_string(), Some("dc@adur.gov.uk".to_string())),
            ("planning_phone".to_string(), None),
        ])
    }

    fn memory_cache() -> (Arc<ManualClock>, EnrichmentCache) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = Arc::new(MemoryCacheBackend::new(clock.clone()));
        let cache = EnrichmentCache::new(backend, "councilgen:enrichment").with_clock(clock.clone());
        (clock, cache)
    }

    /// Backend that is down.
    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(CouncilgenError::Storage("connection refused".into()))
        }
        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
            Err(CouncilgenError::Storage("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(CouncilgenError::Storage("connection refused".into()))
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
            Err(CouncilgenError::Storage("connection refused".into()))
        }
        fn name(&self) -> &str {
            "down"
        }
    }

    /// Backend that never answers.
    struct HangingBackend;

    #[async_trait]
    impl CacheBackend for HangingBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            tokio::time::sleep(HOUR).await;
            Ok(None)
        }
        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
            tokio::time::sleep(HOUR).await;
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
            Ok(None)
        }
        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[test]
    fn keys_are_namespaced() {
        let (_, cache) = memory_cache();
        assert_eq!(cache.key("adur"), "councilgen:enrichment:adur");
    }

    #[tokio::test]
    async fn set_then_get_returns_record() {
        let (_, cache) = memory_cache();
        assert!(cache.get("adur").await.is_none());

        cache.set("adur", &fields()).await.unwrap();
        let record = cache.get("adur").await.expect("hit");
        assert_eq!(record.entity_id, "adur");
        assert_eq!(record.fields, fields());
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, errors: 0 });
    }

    #[tokio::test]
    async fn records_expire_after_ttl() {
        let (clock, cache) = memory_cache();
        cache.set("worthing", &fields()).await.unwrap();

        clock.advance(23 * HOUR);
        assert!(cache.get("worthing").await.is_some());
        let left = cache.remaining_ttl("worthing").await.unwrap();
        assert_eq!(left, HOUR);

        clock.advance(HOUR);
        assert!(cache.get("worthing").await.is_none());
        assert_eq!(cache.remaining_ttl("worthing").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_record() {
        let (_, cache) = memory_cache();
        cache.set("crawley", &fields()).await.unwrap();
        assert!(cache.invalidate("crawley").await);
        assert!(!cache.invalidate("crawley").await);
        assert!(cache.get("crawley").await.is_none());
    }

    #[tokio::test]
    async fn unavailable_backend_never_raises_on_read() {
        let cache = EnrichmentCache::new(Arc::new(DownBackend), "councilgen:enrichment");
        assert!(cache.get("adur").await.is_none());
        assert!(cache.set("adur", &fields()).await.is_err());
        assert_eq!(cache.stats().errors, 2);
    }

    #[tokio::test]
    async fn unavailable_backend_never_raises_on_ttl_or_invalidate() {
        let cache = EnrichmentCache::new(Arc::new(DownBackend), "councilgen:enrichment");
        assert_eq!(cache.remaining_ttl("adur").await, None);
        assert!(!cache.invalidate("adur").await);
        assert_eq!(cache.stats().errors, 2);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_miss() {
        let cache = EnrichmentCache::new(Arc::new(HangingBackend), "councilgen:enrichment")
            .with_op_timeout(Duration::from_millis(50));
        assert!(cache.get("adur").await.is_none());
        assert!(cache.set("adur", &fields()).await.is_err());
    }

    #[tokio::test]
    async fn sqlite_backend_round_trip_and_expiry() {
        let path = std::env::temp_dir().join(format!("cg_cache_{}.db", Uuid::now_v7()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = SqlCacheBackend::open(&path, clock.clone()).await.unwrap();
        let cache = EnrichmentCache::new(Arc::new(backend), "councilgen:enrichment")
            .with_clock(clock.clone());

        cache.set("horsham", &fields()).await.unwrap();
        assert_eq!(cache.get("horsham").await.unwrap().fields, fields());

        clock.advance(ENRICHMENT_TTL);
        assert!(cache.get("horsham").await.is_none());
    }

    #[tokio::test]
    async fn from_config_builds_memory_backend() {
        let config = CacheConfig {
            backend: CacheBackendKind::Memory,
            ..Default::default()
        };
        let cache = EnrichmentCache::from_config(&config).await.unwrap();
        assert_eq!(cache.backend_name(), "memory");
        assert_eq!(cache.key("x"), format!("{}:x", config.namespace));
    }
}
