//! In-process backing store
//!
//! Keeps entries in a mutex-guarded map and fans pub/sub messages out over
//! tokio broadcast channels. Clones share state, so several caches built on
//! clones of one `MemoryStore` behave like separate processes sharing a
//! Redis server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

use crate::CacheError;
use crate::jitter::MAX_TTL;
use crate::store::{BackingStore, SubscriptionEvent};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, now: Instant, ttl: Duration) -> Self {
        Self {
            bytes,
            expires_at: now + ttl.min(MAX_TTL),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct MemoryInner {
    entries: Mutex<HashMap<String, StoredValue>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

/// Backing store living in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of `key`, if it holds a live value
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = lock(&self.inner.entries, "entries");
        entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.expires_at.saturating_duration_since(now))
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.inner.entries, "entries")
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        lock(&self.inner.channels, "channels")
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = lock(&self.inner.entries, "entries");
        match entries.get(key) {
            Some(v) if v.is_live(now) => Some(v.bytes.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Recover the guard from a poisoned mutex; entries are plain data
fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(
            lock = what,
            "Recovered from poisoned memory store lock"
        );
        poisoned.into_inner()
    })
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let stored = StoredValue::new(value.to_vec(), Instant::now(), ttl);
        lock(&self.inner.entries, "entries").insert(key.to_owned(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        lock(&self.inner.entries, "entries").remove(key);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = lock(&self.inner.entries, "entries");
        if entries.get(key).is_some_and(|v| v.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), StoredValue::new(value.to_vec(), now, ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = lock(&self.inner.entries, "entries");
        let matches = entries
            .get(key)
            .is_some_and(|v| v.is_live(now) && v.bytes == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = lock(&self.inner.entries, "entries");
        let current = entries
            .get(key)
            .filter(|v| v.is_live(now))
            .and_then(|v| std::str::from_utf8(&v.bytes).ok()?.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(
            key.to_owned(),
            StoredValue::new(next.to_string().into_bytes(), now, ttl),
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), CacheError> {
        // No subscribers is not an error, matching Redis PUBLISH
        let _ = self.sender(channel).send(message.to_vec());
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> BoxStream<'static, SubscriptionEvent> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_owned();

        let messages = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((SubscriptionEvent::Message(payload), rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::once(async { SubscriptionEvent::Subscribed })
            .chain(messages)
            .boxed()
    }
}
