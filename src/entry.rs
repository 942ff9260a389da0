//! Stored cache entry envelope

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CacheError;
use crate::store::ttl_millis;

/// What the backing store holds under a data key.
///
/// `expires_at` is fixed when the entry is written and never recomputed on
/// read; `version` comes from a store-side counter and grows with every write
/// of the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Unix time in milliseconds
    pub expires_at: u64,
    pub version: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at: now_millis().saturating_add(ttl_millis(ttl)),
            version,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_millis() >= self.expires_at
    }

    /// Time left before `expires_at`, zero once expired
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_millis()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
