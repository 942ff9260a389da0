//! Single-flight coordination of cache-miss computations
//!
//! Concurrent misses for one key inside a process wait on a shared watch
//! channel while a single leader does the work. Across processes the leader
//! holds the distributed lock, re-checks the store, and only computes on a
//! true miss. When the lock cannot be had in time (contention or an
//! unreachable store) the leader computes without caching rather than
//! failing the request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, warn};

use crate::entry::CacheEntry;
use crate::jitter::jittered_ttl;
use crate::keys::Keyspace;
use crate::lock::{DistributedLock, LockToken};
use crate::store::BackingStore;
use crate::{CacheError, Codec};

/// Result of a load
#[derive(Debug, Clone)]
pub struct Loaded {
    pub entry: Arc<CacheEntry>,
    /// False when the value was computed but could not be stored
    pub cached: bool,
}

/// How a leader treats an entry that is already stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Serve a stored entry if another process wrote one meanwhile
    ReadThrough,
    /// Always recompute and overwrite
    Force,
}

type Shared = Option<Result<Loaded, String>>;
type InFlightFetch = watch::Receiver<Shared>;
type InFlightSender = watch::Sender<Shared>;
type InFlightMap = Arc<RwLock<HashMap<String, InFlightFetch>>>;

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes its own entry from the in-flight map and notifies
/// waiters with an error if no result was sent.
struct InFlightGuard {
    key: String,
    in_flight: InFlightMap,
    tx: Option<InFlightSender>,
    /// Identifies this guard's entry in the map
    rx: InFlightFetch,
}

impl InFlightGuard {
    fn complete(mut self, result: Result<Loaded, String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

/// A later flight may already have replaced a finished entry
fn remove_own(map: &mut HashMap<String, InFlightFetch>, key: &str, own: &InFlightFetch) {
    if map.get(key).is_some_and(|rx| rx.same_channel(own)) {
        map.remove(key);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("Computation was cancelled or panicked".to_owned())));
        }

        // try_write avoids blocking in drop; fall back to a cleanup task
        match self.in_flight.try_write() {
            Ok(mut map) => remove_own(&mut map, &self.key, &self.rx),
            Err(_) => {
                let key = std::mem::take(&mut self.key);
                let rx = self.rx.clone();
                let in_flight = Arc::clone(&self.in_flight);
                tokio::spawn(async move {
                    remove_own(&mut *in_flight.write().await, &key, &rx);
                });
            }
        }
    }
}

/// Collapses concurrent computations of one key into a single execution
pub struct SingleFlight {
    store: Arc<dyn BackingStore>,
    keys: Keyspace,
    codec: Codec,
    /// None when the distributed lock is disabled
    lock: Option<DistributedLock>,
    lock_wait: Duration,
    jitter_pct: f64,
    in_flight: InFlightMap,
}

impl SingleFlight {
    pub fn new(
        store: Arc<dyn BackingStore>,
        keys: Keyspace,
        codec: Codec,
        lock: Option<DistributedLock>,
        lock_wait: Duration,
        jitter_pct: f64,
    ) -> Self {
        Self {
            store,
            keys,
            codec,
            lock,
            lock_wait,
            jitter_pct,
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether a computation for `key` is running in this process
    pub async fn is_computing(&self, key: &str) -> bool {
        self.in_flight.read().await.contains_key(key)
    }

    /// Load `key`, computing it at most once across concurrent callers.
    ///
    /// `compute` runs only if this caller becomes the leader and the store
    /// still has no entry (or `mode` is `Force`). Its output is stored with a
    /// jittered `ttl`. A `Force` load never joins a flight that was already
    /// running; it waits for it to finish and then leads its own.
    pub async fn load<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: LoadMode,
        compute: F,
    ) -> Result<Loaded, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, CacheError>>,
    {
        let guard = loop {
            let mut in_flight = self.in_flight.write().await;
            let running = in_flight
                .get(key)
                .filter(|rx| rx.borrow().is_none())
                .cloned();
            match running {
                Some(rx) if mode == LoadMode::ReadThrough => {
                    drop(in_flight);
                    debug!(key = %key, "Waiting for in-flight computation");
                    return wait_for(rx).await;
                }
                Some(rx) => {
                    drop(in_flight);
                    debug!(key = %key, "Waiting for in-flight computation before forced reload");
                    // Its outcome is superseded by the forced load
                    let _ = wait_for(rx).await;
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.to_owned(), rx.clone());
                    break InFlightGuard {
                        key: key.to_owned(),
                        in_flight: Arc::clone(&self.in_flight),
                        tx: Some(tx),
                        rx,
                    };
                }
            }
        };

        let result = self.lead(key, ttl, mode, compute).await;

        guard.complete(match &result {
            Ok(loaded) => Ok(loaded.clone()),
            Err(e) => Err(e.to_string()),
        });

        result
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: LoadMode,
        compute: F,
    ) -> Result<Loaded, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, CacheError>>,
    {
        let token = match &self.lock {
            None => None,
            Some(lock) => match lock.acquire(key, self.lock_wait).await {
                Ok(token) => Some(token),
                Err(e) if matches!(e, CacheError::LockTimeout { .. }) || e.is_unavailable() => {
                    warn!(key = %key, error = %e, "Lock unavailable, computing without caching");
                    return compute_uncached(key, ttl, compute).await;
                }
                Err(e) => return Err(e),
            },
        };

        let result = self.fill(key, ttl, mode, compute).await;

        if let (Some(lock), Some(token)) = (&self.lock, token) {
            self.release(lock, &token).await;
        }

        result
    }

    async fn fill<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        mode: LoadMode,
        compute: F,
    ) -> Result<Loaded, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, CacheError>>,
    {
        if mode == LoadMode::ReadThrough {
            match self.read_entry(key).await {
                Ok(Some(entry)) => {
                    debug!(key = %key, "Cache hit L2 after lock - filled by another holder");
                    return Ok(Loaded {
                        entry: Arc::new(entry),
                        cached: true,
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_unavailable() => {
                    warn!(
                        key = %key,
                        error = %e,
                        "Store re-check failed, computing without caching"
                    );
                    return compute_uncached(key, ttl, compute).await;
                }
                Err(e) => return Err(e),
            }
        }

        let value = compute().await?;
        let ttl = jittered_ttl(ttl, self.jitter_pct);
        let mut entry = CacheEntry::new(key, value, ttl, 0);

        match self.write_entry(&mut entry, ttl).await {
            Ok(()) => {
                debug!(
                    key = %key,
                    version = entry.version,
                    ttl_ms = ttl.as_millis() as u64,
                    "Cache miss - computed and stored"
                );
                Ok(Loaded {
                    entry: Arc::new(entry),
                    cached: true,
                })
            }
            Err(e) if e.is_unavailable() => {
                warn!(key = %key, error = %e, "Store write failed, serving uncached value");
                Ok(Loaded {
                    entry: Arc::new(entry),
                    cached: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, lock: &DistributedLock, token: &LockToken) {
        match lock.release(token).await {
            Ok(()) | Err(CacheError::LockNotOwned { .. }) => {}
            Err(e) => {
                // The lease expires on its own
                warn!(key = %token.key, error = %e, "Failed to release lock");
            }
        }
    }

    /// Read and validate the stored entry for `key`.
    ///
    /// Unparseable payloads are deleted and reported as a miss; expired
    /// entries are a miss; schema violations are returned as errors.
    pub async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let data_key = self.keys.data_key(key);
        let Some(bytes) = self.store.get(&data_key).await? else {
            return Ok(None);
        };

        let entry = match CacheEntry::from_bytes(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Failed to deserialize stored entry. Deleting corrupt entry."
                );
                if let Err(del_err) = self.store.delete(&data_key).await {
                    error!(key = %key, error = %del_err, "Failed to delete corrupt entry");
                }
                return Ok(None);
            }
        };

        if entry.is_expired() {
            return Ok(None);
        }
        self.codec.validate(key, &entry.value)?;
        Ok(Some(entry))
    }

    /// Stamp `entry` with the next version and store it for `ttl`.
    /// The version counter expires together with the entry.
    pub async fn write_entry(
        &self,
        entry: &mut CacheEntry,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        entry.version = self
            .store
            .increment(&self.keys.version_key(&entry.key), ttl)
            .await?;
        self.store
            .set(&self.keys.data_key(&entry.key), &entry.to_bytes()?, ttl)
            .await
    }
}

async fn compute_uncached<F, Fut>(
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<Loaded, CacheError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, CacheError>>,
{
    let value = compute().await?;
    Ok(Loaded {
        entry: Arc::new(CacheEntry::new(key, value, ttl, 0)),
        cached: false,
    })
}

async fn wait_for(mut rx: InFlightFetch) -> Result<Loaded, CacheError> {
    loop {
        if let Some(result) = rx.borrow_and_update().as_ref() {
            return result.clone().map_err(|e| CacheError::Compute(e.into()));
        }
        if rx.changed().await.is_err() {
            return Err(CacheError::Compute("In-flight computation was cancelled".into()));
        }
    }
}
