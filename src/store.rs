//! Backing store abstraction
//!
//! All durable cache state lives behind this trait. Implementations must
//! provide atomic set-if-absent and compare-and-delete, which the distributed
//! lock relies on.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::CacheError;
use crate::jitter::MAX_TTL;

/// Event produced by a subscription stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The channel is (re)subscribed and messages will flow
    Subscribed,
    /// A payload published on the channel
    Message(Vec<u8>),
    /// The subscription connection was lost; a reconnect is underway
    Disconnected,
}

/// Transport to a remote key-value store
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Store `value` only if `key` holds nothing. Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Delete `key` only if it still holds `expected`. Returns whether it was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError>;

    /// Atomically increment a counter and set it to expire after `ttl`,
    /// returning the new value
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CacheError>;

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), CacheError>;

    /// Infinite stream of events for `channel`.
    ///
    /// The stream survives connection loss: it reports `Disconnected`,
    /// reconnects, re-subscribes and reports `Subscribed` again.
    fn subscribe(&self, channel: &str) -> BoxStream<'static, SubscriptionEvent>;
}

/// Milliseconds for a store-side expiry, between 1 and `MAX_TTL`
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}
