//! Read-through cache facade
//!
//! Lookup order for `get_or_compute`:
//! - Local layer: per-process Moka cache of decoded entries (optional)
//! - Backing store: shared across processes, entries carry a jittered expiry
//! - Compute: single-flight, under the distributed lock when enabled
//!
//! Writes and invalidations are broadcast on the pub/sub channel so other
//! processes drop their local copies.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::CacheEntry;
use crate::error::BoxError;
use crate::jitter::jittered_ttl;
use crate::keys::Keyspace;
use crate::listener::{
    InvalidationHandler, InvalidationMessage, InvalidationReason, ListenerHandle, ListenerState,
    start_listener,
};
use crate::lock::DistributedLock;
use crate::single_flight::{LoadMode, SingleFlight};
use crate::store::BackingStore;
use crate::{CacheConfig, CacheError, Codec, RedisStore, Schema};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Recomputes values for keys under a prefix when another process
/// announces a refresh.
#[async_trait]
pub trait Refresher: Send + Sync + 'static {
    async fn recompute(&self, key: &str) -> Result<Value, BoxError>;
}

/// Distributed read-through cache
#[derive(Clone)]
pub struct SmartCache {
    inner: Arc<SmartCacheInner>,
}

struct SmartCacheInner {
    config: CacheConfig,
    store: Arc<dyn BackingStore>,
    keys: Keyspace,
    codec: Codec,
    local: Option<Cache<String, Arc<CacheEntry>>>,
    flight: SingleFlight,
    /// Sorted by prefix length, longest first
    refreshers: Vec<(String, Arc<dyn Refresher>)>,
    origin_id: String,
    listener: Mutex<Option<ListenerHandle>>,
}

/// Assembles a [`SmartCache`]
pub struct SmartCacheBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn BackingStore>>,
    schemas: Vec<(String, Schema)>,
    refreshers: Vec<(String, Arc<dyn Refresher>)>,
}

impl SmartCacheBuilder {
    /// Use `store` instead of connecting to `config.redis_url`
    pub fn store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Declare the shape of values stored under keys starting with `prefix`.
    /// Checked only when `validate_schema` is enabled.
    pub fn schema(mut self, prefix: impl Into<String>, schema: Schema) -> Self {
        self.schemas.push((prefix.into(), schema));
        self
    }

    /// Recompute keys starting with `prefix` when a refresh is announced
    pub fn refresher<R: Refresher>(mut self, prefix: impl Into<String>, refresher: R) -> Self {
        self.refreshers.push((prefix.into(), Arc::new(refresher)));
        self
    }

    pub async fn build(self) -> Result<SmartCache, CacheError> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn BackingStore> = match self.store {
            Some(store) => store,
            None => Arc::new(RedisStore::connect(&config).await?),
        };

        let keys = Keyspace::new(config.key_prefix.clone());
        let codec = Codec::new(config.validate_schema, self.schemas);
        let lock = config.use_redis_lock.then(|| {
            DistributedLock::new(Arc::clone(&store), keys.clone(), config.lock_timeout)
        });
        let flight = SingleFlight::new(
            Arc::clone(&store),
            keys.clone(),
            codec.clone(),
            lock,
            config.lock_timeout,
            config.jitter_pct,
        );

        let local = config.local_layer_enabled().then(|| {
            Cache::builder()
                .max_capacity(config.l1_max_capacity)
                .time_to_live(config.l1_ttl)
                .build()
        });

        let mut refreshers = self.refreshers;
        refreshers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let cache = SmartCache {
            inner: Arc::new(SmartCacheInner {
                origin_id: Uuid::new_v4().to_string(),
                config,
                store,
                keys,
                codec,
                local,
                flight,
                refreshers,
                listener: Mutex::new(None),
            }),
        };

        if cache.inner.config.start_listener {
            cache.start_listener().await;
        }

        Ok(cache)
    }
}

impl SmartCache {
    pub fn builder(config: CacheConfig) -> SmartCacheBuilder {
        SmartCacheBuilder {
            config,
            store: None,
            schemas: Vec::new(),
            refreshers: Vec::new(),
        }
    }

    /// Connect to Redis using `config` with no schemas or refreshers
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Identifier this instance stamps on the messages it publishes
    pub fn origin_id(&self) -> &str {
        &self.inner.origin_id
    }

    /// Start the invalidation listener if it is not running
    pub async fn start_listener(&self) {
        let mut listener = self.inner.listener.lock().await;
        if listener.is_some() {
            return;
        }
        let handler = Arc::new(LocalInvalidator {
            cache: Arc::downgrade(&self.inner),
        });
        *listener = Some(start_listener(
            Arc::clone(&self.inner.store),
            &self.inner.config.pubsub_channel,
            handler,
        ));
    }

    /// Current listener state, `Stopped` if none was started
    pub async fn listener_state(&self) -> ListenerState {
        match self.inner.listener.lock().await.as_ref() {
            Some(handle) => handle.state(),
            None => ListenerState::Stopped,
        }
    }

    /// Wait until the listener is subscribed. Returns at once if none runs.
    pub async fn wait_until_listening(&self) {
        let state = self
            .inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(ListenerHandle::watch_state);
        if let Some(mut state) = state {
            // Err means the listener stopped for good
            let _ = state.wait_for(|s| *s == ListenerState::Listening).await;
        }
    }

    /// Stop the listener and wait for its task to finish
    pub async fn shutdown(&self) {
        let handle = self.inner.listener.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Get `key`, computing and storing it on a miss with the default TTL
    pub async fn get_or_compute<V, F, Fut, E>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<V, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        self.get_or_compute_with_ttl(key, self.inner.config.default_ttl, compute)
            .await
    }

    /// Get `key`, computing and storing it for about `ttl` on a miss
    pub async fn get_or_compute_with_ttl<V, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<V, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        if let Some(entry) = self.lookup(key).await? {
            return self.inner.codec.from_value(key, entry.value.clone());
        }

        debug!(key = %key, "Cache miss L1 and L2");
        let codec = &self.inner.codec;
        let loaded = self
            .inner
            .flight
            .load(key, ttl, LoadMode::ReadThrough, || async move {
                let value = compute().await.map_err(|e| CacheError::Compute(e.into()))?;
                codec.to_value(key, &value)
            })
            .await?;

        if loaded.cached {
            self.remember(key, Arc::clone(&loaded.entry)).await;
        }
        self.inner.codec.from_value(key, loaded.entry.value.clone())
    }

    /// Get `key` without computing it
    pub async fn get<V: Cacheable>(&self, key: &str) -> Result<Option<V>, CacheError> {
        match self.lookup(key).await? {
            Some(entry) => self.inner.codec.from_value(key, entry.value.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Store `value` under `key` for about `ttl` and tell other processes
    pub async fn set<V: Cacheable>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let tree = self.inner.codec.to_value(key, value)?;
        let ttl = jittered_ttl(ttl, self.inner.config.jitter_pct);
        let mut entry = CacheEntry::new(key, tree, ttl, 0);
        self.inner.flight.write_entry(&mut entry, ttl).await?;

        self.remember(key, Arc::new(entry)).await;
        self.announce(key, InvalidationReason::Refresh).await;
        Ok(())
    }

    /// Recompute `key` even if it is stored, then tell other processes
    pub async fn refresh<V, F, Fut, E>(&self, key: &str, compute: F) -> Result<V, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        let codec = &self.inner.codec;
        let loaded = self
            .inner
            .flight
            .load(key, self.inner.config.default_ttl, LoadMode::Force, || async move {
                let value = compute().await.map_err(|e| CacheError::Compute(e.into()))?;
                codec.to_value(key, &value)
            })
            .await?;

        self.forget(key).await;
        if loaded.cached {
            self.remember(key, Arc::clone(&loaded.entry)).await;
            self.announce(key, InvalidationReason::Refresh).await;
        }
        self.inner.codec.from_value(key, loaded.entry.value.clone())
    }

    /// Delete `key` everywhere
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        debug!(key = %key, "Invalidating cache");
        self.forget(key).await;
        self.inner
            .store
            .delete(&self.inner.keys.data_key(key))
            .await?;
        self.announce(key, InvalidationReason::Explicit).await;
        Ok(())
    }

    /// Whether `key` currently has a copy in this process
    pub async fn is_cached_locally(&self, key: &str) -> bool {
        match &self.inner.local {
            Some(local) => local.get(key).await.is_some(),
            None => false,
        }
    }

    /// Local layer first, then the backing store. An unreachable store reads as a miss.
    async fn lookup(&self, key: &str) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        if let Some(local) = &self.inner.local
            && let Some(entry) = local.get(key).await
        {
            if !entry.is_expired() {
                debug!(key = %key, "Cache hit L1");
                return Ok(Some(entry));
            }
            local.invalidate(key).await;
        }

        match self.inner.flight.read_entry(key).await {
            Ok(Some(entry)) => {
                debug!(key = %key, version = entry.version, "Cache hit L2");
                let entry = Arc::new(entry);
                self.remember(key, Arc::clone(&entry)).await;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_unavailable() => {
                warn!(key = %key, error = %e, "Store read failed. Treating as a miss.");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn remember(&self, key: &str, entry: Arc<CacheEntry>) {
        if let Some(local) = &self.inner.local {
            local.insert(key.to_owned(), entry).await;
        }
    }

    async fn forget(&self, key: &str) {
        if let Some(local) = &self.inner.local {
            local.invalidate(key).await;
        }
    }

    /// Publish an invalidation message - best effort
    async fn announce(&self, key: &str, reason: InvalidationReason) {
        let channel = &self.inner.config.pubsub_channel;
        let message = InvalidationMessage::new(key, reason, self.inner.origin_id.clone());
        let published = match message.to_bytes() {
            Ok(payload) => self.inner.store.publish(channel, &payload).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => {
                debug!(channel = %channel, key = %key, reason = ?reason, "Invalidation published")
            }
            Err(e) => warn!(
                channel = %channel,
                key = %key,
                error = %e,
                "Failed to publish invalidation. Other processes converge on TTL expiry."
            ),
        }
    }

    fn refresher_for(&self, key: &str) -> Option<Arc<dyn Refresher>> {
        self.inner
            .refreshers
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, refresher)| Arc::clone(refresher))
    }

    /// Repopulate the local layer for `key` after a refresh elsewhere
    async fn warm(&self, key: &str) -> Result<(), CacheError> {
        let Some(refresher) = self.refresher_for(key) else {
            return Ok(());
        };
        if self.lookup(key).await?.is_some() {
            return Ok(());
        }

        let codec = &self.inner.codec;
        let loaded = self
            .inner
            .flight
            .load(key, self.inner.config.default_ttl, LoadMode::ReadThrough, || async move {
                let value = refresher.recompute(key).await.map_err(CacheError::Compute)?;
                codec.validate(key, &value)?;
                Ok(value)
            })
            .await?;
        if loaded.cached {
            self.remember(key, loaded.entry).await;
        }
        Ok(())
    }
}

/// Evicts local copies when other processes announce changes
struct LocalInvalidator {
    cache: Weak<SmartCacheInner>,
}

#[async_trait]
impl InvalidationHandler for LocalInvalidator {
    async fn on_invalidation(&self, message: InvalidationMessage) {
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        if message.origin_id == inner.origin_id {
            return;
        }
        let cache = SmartCache { inner };
        cache.forget(&message.key).await;
        debug!(key = %message.key, origin_id = %message.origin_id, "Local copy evicted");

        if message.reason == InvalidationReason::Refresh
            && cache.refresher_for(&message.key).is_some()
        {
            // Off the listener task so one slow recompute does not stall evictions
            tokio::spawn(async move {
                if let Err(e) = cache.warm(&message.key).await {
                    warn!(key = %message.key, error = %e, "Background refresh failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use crate::store::SubscriptionEvent;
    use futures::StreamExt;
    use futures::stream::BoxStream;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    fn config() -> CacheConfig {
        CacheConfig {
            start_listener: false,
            ..CacheConfig::default()
        }
    }

    async fn cache_on(store: &MemoryStore, config: CacheConfig) -> SmartCache {
        SmartCache::builder(config)
            .store(Arc::new(store.clone()))
            .build()
            .await
            .expect("build cache")
    }

    async fn slow_value(
        calls: Arc<AtomicUsize>,
        value: &'static str,
        delay: Duration,
    ) -> Result<String, BoxError> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(value.to_owned())
    }

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "condition not reached in time");
    }

    /// Store whose every call fails as if Redis were unreachable
    struct UnreachableStore;

    #[async_trait]
    impl BackingStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        async fn compare_and_delete(
            &self,
            _key: &str,
            _expected: &[u8],
        ) -> Result<bool, CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        async fn publish(&self, _channel: &str, _message: &[u8]) -> Result<(), CacheError> {
            Err(CacheError::Connection("refused".to_owned()))
        }

        fn subscribe(&self, _channel: &str) -> BoxStream<'static, SubscriptionEvent> {
            futures::stream::pending().boxed()
        }
    }

    #[tokio::test]
    async fn test_miss_computes_then_hits() {
        let store = MemoryStore::new();
        let cache = cache_on(&store, config()).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let first: String = cache
            .get_or_compute("k", || slow_value(Arc::clone(&calls), "v1", Duration::ZERO))
            .await
            .unwrap();
        let second: String = cache
            .get_or_compute("k", || slow_value(Arc::clone(&calls), "v2", Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(first, "v1");
        assert_eq!(second, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached_locally("k").await);
        assert!(store.get("smartcache:k").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_across_processes_compute_once() {
        let store = MemoryStore::new();
        let caches = [
            cache_on(&store, config()).await,
            cache_on(&store, config()).await,
        ];
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let cache = caches[i % 2].clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute::<String, _, _, _>("shared", || {
                            slow_value(calls, "computed", Duration::from_millis(50))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_lock_collapsing_is_per_process() {
        let store = MemoryStore::new();
        let no_lock = CacheConfig {
            use_redis_lock: false,
            ..config()
        };
        let a = cache_on(&store, no_lock.clone()).await;
        let b = cache_on(&store, no_lock).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let cache = if i < 3 { a.clone() } else { b.clone() };
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute::<String, _, _, _>("k", || {
                            slow_value(calls, "v", Duration::from_millis(50))
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "v");
        }

        // One computation per process
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lock_contention_serves_uncached_value() {
        let store = MemoryStore::new();
        let cache = cache_on(
            &store,
            CacheConfig {
                lock_timeout: Duration::from_millis(100),
                ..config()
            },
        )
        .await;

        let other_process = DistributedLock::new(
            Arc::new(store.clone()),
            Keyspace::new("smartcache:"),
            Duration::from_secs(30),
        );
        let _held = other_process.acquire("k", Duration::ZERO).await.unwrap();

        let value: String = cache
            .get_or_compute("k", || async { Ok::<_, BoxError>("direct".to_owned()) })
            .await
            .expect("falls back instead of failing");

        assert_eq!(value, "direct");
        assert!(store.get("smartcache:k").await.unwrap().is_none());
        assert!(!cache.is_cached_locally("k").await);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_always_miss() {
        let cache = SmartCache::builder(config())
            .store(Arc::new(UnreachableStore))
            .build()
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let value: String = cache
                .get_or_compute("k", || slow_value(Arc::clone(&calls), "v", Duration::ZERO))
                .await
                .unwrap();
            assert_eq!(value, "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            cache.invalidate("k").await,
            Err(CacheError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_compute_error_is_returned() {
        let cache = cache_on(&MemoryStore::new(), config()).await;
        let result = cache
            .get_or_compute::<String, _, _, _>("k", || async {
                Err::<String, BoxError>("database offline".into())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Compute(_))));
    }

    #[tokio::test]
    async fn test_stored_expiry_respects_jitter() {
        let store = MemoryStore::new();
        let cache = cache_on(&store, config()).await;
        let base = Duration::from_secs(300);

        for i in 0..100 {
            let key = format!("item:{i}");
            let _: u64 = cache
                .get_or_compute_with_ttl(&key, base, || async move { Ok::<_, BoxError>(i) })
                .await
                .unwrap();

            let bytes = store.get(&format!("smartcache:{key}")).await.unwrap().unwrap();
            let entry = CacheEntry::from_bytes(&bytes).unwrap();
            let remaining = entry.remaining_ttl();
            assert!(remaining >= Duration::from_secs(269), "{remaining:?}");
            assert!(remaining <= Duration::from_secs(330), "{remaining:?}");
            assert!(entry.version >= 1);
        }
    }

    #[tokio::test]
    async fn test_unbounded_ttl_is_stored_with_capped_expiry() {
        let store = MemoryStore::new();
        let cache = cache_on(&store, config()).await;

        let value: u64 = cache
            .get_or_compute_with_ttl("k", Duration::MAX, || async { Ok::<_, BoxError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let remaining = store.remaining_ttl("smartcache:k").expect("stored");
        assert!(remaining <= crate::jitter::MAX_TTL, "{remaining:?}");
        cache.set("s", &1u64, Duration::MAX).await.unwrap();
        assert_eq!(cache.get::<u64>("s").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_keys_leave_nothing_behind() {
        let store = MemoryStore::new();
        let cache = cache_on(&store, config()).await;
        let ttl = Duration::from_secs(60);

        for i in 0..100u64 {
            let key = format!("item:{i}");
            let _: u64 = cache
                .get_or_compute_with_ttl(&key, ttl, || async move { Ok::<_, BoxError>(i) })
                .await
                .unwrap();
            cache.invalidate(&key).await.unwrap();
        }

        let counter_ttl = store
            .remaining_ttl("smartcache:version:item:0")
            .expect("counter carries an expiry");
        assert!(counter_ttl <= ttl.mul_f64(1.1) + Duration::from_millis(1));

        tokio::time::advance(ttl.mul_f64(1.1) + Duration::from_millis(1)).await;
        assert!(store.is_empty(), "{} keys left", store.len());
    }

    #[tokio::test]
    async fn test_refresh_recomputes_while_read_is_in_flight() {
        let cache = cache_on(&MemoryStore::new(), config()).await;
        let refresh_calls = Arc::new(AtomicUsize::new(0));

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute::<String, _, _, _>("k", || {
                        slow_value(Arc::new(AtomicUsize::new(0)), "old", Duration::from_millis(100))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh: String = cache
            .refresh("k", || slow_value(Arc::clone(&refresh_calls), "new", Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), "old");
        assert_eq!(fresh, "new");
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get::<String>("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_invalidate_evicts_other_process() {
        let store = MemoryStore::new();
        let listening = CacheConfig {
            start_listener: true,
            ..config()
        };
        let a = cache_on(&store, listening.clone()).await;
        let b = cache_on(&store, listening).await;
        a.wait_until_listening().await;
        b.wait_until_listening().await;

        let user = User {
            id: 1,
            name: "ada".to_owned(),
        };
        let cached: User = b
            .get_or_compute("user:1", || {
                let user = user.clone();
                async move { Ok::<_, BoxError>(user) }
            })
            .await
            .unwrap();
        assert_eq!(cached, user);
        assert!(b.is_cached_locally("user:1").await);

        a.invalidate("user:1").await.unwrap();
        eventually(|| async { !b.is_cached_locally("user:1").await }).await;

        let renamed: User = b
            .get_or_compute("user:1", || async {
                Ok::<_, BoxError>(User {
                    id: 1,
                    name: "grace".to_owned(),
                })
            })
            .await
            .unwrap();
        assert_eq!(renamed.name, "grace");

        a.shutdown().await;
        b.shutdown().await;
        assert_eq!(a.listener_state().await, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_set_is_visible_to_other_process() {
        let store = MemoryStore::new();
        let listening = CacheConfig {
            start_listener: true,
            ..config()
        };
        let a = cache_on(&store, listening.clone()).await;
        let b = cache_on(&store, listening).await;
        b.wait_until_listening().await;

        b.set("count", &1u64, Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get::<u64>("count").await.unwrap(), Some(1));

        a.set("count", &2u64, Duration::from_secs(60)).await.unwrap();
        eventually(|| async { b.get::<u64>("count").await.unwrap() == Some(2) }).await;
        assert_eq!(a.get::<u64>("missing").await.unwrap(), None);
    }

    struct CountingRefresher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Refresher for CountingRefresher {
        async fn recompute(&self, key: &str) -> Result<Value, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(format!("recomputed {key}")))
        }
    }

    #[tokio::test]
    async fn test_refresh_warms_other_process_from_store() {
        let store = MemoryStore::new();
        let refresher_calls = Arc::new(AtomicUsize::new(0));
        let a = cache_on(&store, config()).await;
        let b = SmartCache::builder(CacheConfig {
            start_listener: true,
            ..config()
        })
        .store(Arc::new(store.clone()))
        .refresher(
            "report:",
            CountingRefresher {
                calls: Arc::clone(&refresher_calls),
            },
        )
        .build()
        .await
        .unwrap();
        b.wait_until_listening().await;

        let _: String = b
            .get_or_compute("report:daily", || async { Ok::<_, BoxError>("v1".to_owned()) })
            .await
            .unwrap();

        let fresh: String = a
            .refresh("report:daily", || async { Ok::<_, BoxError>("v2".to_owned()) })
            .await
            .unwrap();
        assert_eq!(fresh, "v2");

        eventually(|| async {
            b.get::<String>("report:daily").await.unwrap().as_deref() == Some("v2")
        })
        .await;
        eventually(|| async { b.is_cached_locally("report:daily").await }).await;
        // The refreshed value was already stored, so nothing is recomputed
        assert_eq!(refresher_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schema_violations_surface() {
        let store = MemoryStore::new();
        let cache = SmartCache::builder(CacheConfig {
            validate_schema: true,
            ..config()
        })
        .store(Arc::new(store.clone()))
        .schema(
            "user:",
            Schema::object([("id", Schema::Integer), ("name", Schema::String)]),
        )
        .build()
        .await
        .unwrap();

        let computed = cache
            .get_or_compute::<Value, _, _, _>("user:1", || async {
                Ok::<_, BoxError>(json!({"id": "one", "name": "ada"}))
            })
            .await;
        assert!(matches!(computed, Err(CacheError::Schema { .. })));
        assert!(store.get("smartcache:user:1").await.unwrap().is_none());

        let foreign = CacheEntry::new("user:2", json!({"id": 2}), Duration::from_secs(60), 1);
        store
            .set("smartcache:user:2", &foreign.to_bytes().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        let stored = cache.get::<User>("user:2").await;
        assert!(matches!(stored, Err(CacheError::Schema { .. })));

        // Keys without a schema are not checked
        let other: Value = cache
            .get_or_compute("order:1", || async { Ok::<_, BoxError>(json!({"any": true})) })
            .await
            .unwrap();
        assert_eq!(other, json!({"any": true}));
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let cache = cache_on(
            &MemoryStore::new(),
            CacheConfig {
                start_listener: true,
                ..config()
            },
        )
        .await;
        cache.wait_until_listening().await;
        assert_eq!(cache.listener_state().await, ListenerState::Listening);

        cache.shutdown().await;
        assert_eq!(cache.listener_state().await, ListenerState::Stopped);

        cache.start_listener().await;
        cache.wait_until_listening().await;
        assert_eq!(cache.listener_state().await, ListenerState::Listening);
    }
}
