//! Distributed lock over the backing store
//!
//! Acquisition is an atomic set-if-absent of a random owner id with a fixed
//! expiry; contenders poll with bounded backoff. Release deletes the key only
//! while it still holds the caller's owner id, so a holder whose token
//! expired can never release a lock that has since been handed to someone
//! else. A crashed holder blocks others for at most one expiry period.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jitter::MAX_TTL;
use crate::keys::Keyspace;
use crate::store::BackingStore;
use crate::CacheError;

const POLL_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const POLL_MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Proof of lock ownership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    /// Cache key the lock protects
    pub key: String,
    pub owner_id: String,
    /// When the store drops the token on its own
    pub expires_at: SystemTime,
}

/// Mutual exclusion per cache key, shared by every process on the store
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn BackingStore>,
    keys: Keyspace,
    /// Validity of each token
    lease: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn BackingStore>, keys: Keyspace, lease: Duration) -> Self {
        Self {
            store,
            keys,
            lease: lease.min(MAX_TTL),
        }
    }

    /// Try once, without waiting
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockToken>, CacheError> {
        let owner_id = Uuid::new_v4().to_string();
        let expires_at = SystemTime::now() + self.lease;
        let acquired = self
            .store
            .set_if_absent(&self.keys.lock_key(key), owner_id.as_bytes(), self.lease)
            .await?;

        Ok(acquired.then(|| LockToken {
            key: key.to_owned(),
            owner_id,
            expires_at,
        }))
    }

    /// Acquire the lock for `key`, polling until `wait` has elapsed
    pub async fn acquire(&self, key: &str, wait: Duration) -> Result<LockToken, CacheError> {
        let started = Instant::now();
        let deadline = started + wait.min(MAX_TTL);
        let mut backoff = POLL_INITIAL_BACKOFF;

        loop {
            if let Some(token) = self.try_acquire(key).await? {
                debug!(key = %key, owner_id = %token.owner_id, "Lock acquired");
                return Ok(token);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, waited_ms = wait.as_millis() as u64, "Lock acquisition timed out");
                return Err(CacheError::LockTimeout {
                    key: key.to_owned(),
                    waited: now - started,
                });
            }

            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(POLL_MAX_BACKOFF);
        }
    }

    /// Release a lock previously acquired
    pub async fn release(&self, token: &LockToken) -> Result<(), CacheError> {
        let released = self
            .store
            .compare_and_delete(&self.keys.lock_key(&token.key), token.owner_id.as_bytes())
            .await?;

        if released {
            debug!(key = %token.key, owner_id = %token.owner_id, "Lock released");
            Ok(())
        } else {
            warn!(
                key = %token.key,
                owner_id = %token.owner_id,
                "Lock expired before release and may belong to another holder"
            );
            Err(CacheError::LockNotOwned {
                key: token.key.clone(),
                owner_id: token.owner_id.clone(),
            })
        }
    }
}
