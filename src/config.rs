//! Cache configuration

use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::CacheError;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
const DEFAULT_PUBSUB_CHANNEL: &str = "smartcache:updates";
const DEFAULT_KEY_PREFIX: &str = "smartcache:";
const ENV_PREFIX: &str = "SMARTCACHE";

/// Configuration for the distributed cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Backing store endpoint
    pub redis_url: String,
    /// Base time-to-live for stored entries
    pub default_ttl: Duration,
    /// Coordinate computations cache-wide through a Redis lock.
    /// When disabled, concurrent misses are only collapsed within one process.
    pub use_redis_lock: bool,
    /// Validity of a lock token, and the longest a caller waits to acquire one
    pub lock_timeout: Duration,
    /// Pub/sub channel carrying invalidation messages
    pub pubsub_channel: String,
    /// Start the invalidation listener when the cache is built
    pub start_listener: bool,
    /// Fractional TTL jitter, 0.1 = ±10%
    pub jitter_pct: f64,
    /// Check registered schemas on encode and decode
    pub validate_schema: bool,
    /// Namespace prepended to every key written to the backing store
    pub key_prefix: String,
    /// Deadline for a single backing-store call
    pub command_timeout: Duration,
    /// Extra attempts for idempotent commands that fail on the transport
    pub connection_retries: u32,
    /// Maximum number of entries in the local layer (0 disables it)
    pub l1_max_capacity: u64,
    /// Time-to-live for local entries
    pub l1_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_owned(),
            default_ttl: Duration::from_secs(300), // 5 minutes
            use_redis_lock: true,
            lock_timeout: Duration::from_secs(5),
            pubsub_channel: DEFAULT_PUBSUB_CHANNEL.to_owned(),
            start_listener: true,
            jitter_pct: 0.1,
            validate_schema: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            command_timeout: Duration::from_millis(2000),
            connection_retries: 1,
            l1_max_capacity: 1000,
            l1_ttl: Duration::from_secs(30),
        }
    }
}

/// Settings as they arrive from the environment, before defaults and validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    redis_url: Option<String>,
    default_ttl: Option<f64>,
    use_redis_lock: Option<bool>,
    lock_timeout: Option<f64>,
    pubsub_channel: Option<String>,
    start_listener: Option<bool>,
    jitter_pct: Option<f64>,
    validate_schema: Option<bool>,
    key_prefix: Option<String>,
    command_timeout_ms: Option<u64>,
    connection_retries: Option<u32>,
    l1_max_capacity: Option<u64>,
    l1_ttl: Option<f64>,
}

impl CacheConfig {
    /// Load from `SMARTCACHE_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, CacheError> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Self::from_settings(&settings)
    }

    /// Build from an already assembled `config::Config`
    pub fn from_settings(settings: &Config) -> Result<Self, CacheError> {
        let raw: RawSettings = settings.clone().try_deserialize()?;
        let defaults = Self::default();

        let config = Self {
            redis_url: raw.redis_url.unwrap_or(defaults.redis_url),
            default_ttl: seconds("default_ttl", raw.default_ttl, defaults.default_ttl)?,
            use_redis_lock: raw.use_redis_lock.unwrap_or(defaults.use_redis_lock),
            lock_timeout: seconds("lock_timeout", raw.lock_timeout, defaults.lock_timeout)?,
            pubsub_channel: raw.pubsub_channel.unwrap_or(defaults.pubsub_channel),
            start_listener: raw.start_listener.unwrap_or(defaults.start_listener),
            jitter_pct: raw.jitter_pct.unwrap_or(defaults.jitter_pct),
            validate_schema: raw.validate_schema.unwrap_or(defaults.validate_schema),
            key_prefix: raw.key_prefix.unwrap_or(defaults.key_prefix),
            command_timeout: raw
                .command_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),
            connection_retries: raw
                .connection_retries
                .unwrap_or(defaults.connection_retries),
            l1_max_capacity: raw.l1_max_capacity.unwrap_or(defaults.l1_max_capacity),
            l1_ttl: seconds("l1_ttl", raw.l1_ttl, defaults.l1_ttl)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the cache cannot operate with
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.redis_url.trim().is_empty() {
            return Err(CacheError::config("redis_url", "must not be empty"));
        }
        if self.pubsub_channel.trim().is_empty() {
            return Err(CacheError::config("pubsub_channel", "must not be empty"));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::config("default_ttl", "must be positive"));
        }
        if self.lock_timeout.is_zero() {
            return Err(CacheError::config("lock_timeout", "must be positive"));
        }
        if self.command_timeout.is_zero() {
            return Err(CacheError::config("command_timeout_ms", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.jitter_pct) {
            return Err(CacheError::config(
                "jitter_pct",
                format!("{} is outside [0, 1)", self.jitter_pct),
            ));
        }
        Ok(())
    }

    /// Whether decoded entries are also kept in process memory
    pub fn local_layer_enabled(&self) -> bool {
        self.l1_max_capacity > 0 && !self.l1_ttl.is_zero()
    }
}

fn seconds(key: &'static str, value: Option<f64>, default: Duration) -> Result<Duration, CacheError> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|e| {
            CacheError::config(key, format!("{secs} is not a valid number of seconds: {e}"))
        }),
    }
}
