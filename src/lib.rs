//! smartcache - Distributed read-through cache
//!
//! This library provides a shared cache in front of expensive computations:
//! - L1: optional in-memory Moka layer per process (fastest)
//! - L2: Redis, shared across processes and hosts
//! - Compute: caller-supplied, run at most once per key cache-wide
//!
//! The cache supports:
//! - Single-flight computation with a Redis lock for stampede protection
//! - Degraded uncached computation when the lock or the store is unavailable
//! - TTL jitter so entries written together do not expire together
//! - Redis pub/sub for cache invalidation across processes
//! - Optional schema validation of cached payloads

mod codec;
mod config;
mod entry;
mod error;
pub mod jitter;
mod keys;
pub mod listener;
pub mod lock;
mod memory_store;
mod redis_store;
mod schema;
pub mod single_flight;
mod smart_cache;
pub mod store;

pub use codec::Codec;
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use error::{BoxError, CacheError};
pub use keys::Keyspace;
pub use listener::{InvalidationMessage, InvalidationReason, ListenerHandle, ListenerState};
pub use lock::{DistributedLock, LockToken};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use schema::{Schema, SchemaViolation};
pub use smart_cache::{Cacheable, Refresher, SmartCache, SmartCacheBuilder};
pub use store::{BackingStore, SubscriptionEvent};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
