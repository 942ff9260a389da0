//! Redis implementation of the backing store
//!
//! Request-path commands share one `ConnectionManager`, which reconnects on
//! its own. Each subscription stream opens a dedicated pub/sub connection so
//! a slow listener never holds up request traffic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, info, warn};

use crate::store::{BackingStore, SubscriptionEvent, ttl_millis};
use crate::{CacheConfig, CacheError};

/// Deletes KEYS[1] only while it still holds ARGV[1]
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Increments KEYS[1] and sets it to expire after ARGV[1] milliseconds
const INCREMENT_WITH_EXPIRY: &str = r#"
local value = redis.call("INCR", KEYS[1])
redis.call("PEXPIRE", KEYS[1], ARGV[1])
return value
"#;

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Backing store over a Redis server
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    command_timeout: Duration,
    retries: u32,
    release_script: Arc<redis::Script>,
    increment_script: Arc<redis::Script>,
}

impl RedisStore {
    /// Open a client for `config.redis_url` and establish the shared connection
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = match tokio::time::timeout(
            config.command_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        {
            Ok(conn) => conn.map_err(|e| with_deadline(e.into(), config.command_timeout))?,
            Err(_) => return Err(CacheError::Timeout(config.command_timeout)),
        };
        info!(url = %config.redis_url, "Connected to Redis backing store");

        Ok(Self {
            client,
            conn,
            command_timeout: config.command_timeout,
            retries: config.connection_retries,
            release_script: Arc::new(redis::Script::new(COMPARE_AND_DELETE)),
            increment_script: Arc::new(redis::Script::new(INCREMENT_WITH_EXPIRY)),
        })
    }

    /// Run one Redis call under the command deadline
    async fn bounded<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(|e| with_deadline(e.into(), self.command_timeout)),
            Err(_) => Err(CacheError::Timeout(self.command_timeout)),
        }
    }

    /// Run an idempotent command, retrying transport failures
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut command: F) -> Result<T, CacheError>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match self.bounded(command(self.conn.clone())).await {
                Err(CacheError::Connection(reason)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(op, attempt, error = %reason, "Redis connection error, retrying");
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.with_retry("GET", |mut conn| async move {
            conn.get::<_, Option<Vec<u8>>>(key).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let millis = ttl_millis(ttl);
        self.with_retry("PSETEX", |mut conn| async move {
            conn.pset_ex::<_, _, ()>(key, value, millis).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.with_retry("DEL", |mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .bounded(
                self.release_script
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        self.bounded(
            self.increment_script
                .key(key)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<(), CacheError> {
        self.with_retry("PUBLISH", |mut conn| async move {
            conn.publish::<_, _, ()>(channel, message).await
        })
        .await
    }

    fn subscribe(&self, channel: &str) -> BoxStream<'static, SubscriptionEvent> {
        let client = self.client.clone();
        let channel = channel.to_owned();
        let timeout = self.command_timeout;

        stream::unfold(
            SubscriptionState::Connecting {
                backoff: RESUBSCRIBE_INITIAL_BACKOFF,
            },
            move |state| {
                let client = client.clone();
                let channel = channel.clone();
                async move { next_event(&client, &channel, timeout, state).await }
            },
        )
        .boxed()
    }
}

enum SubscriptionState {
    Connecting { backoff: Duration },
    Listening(BoxStream<'static, redis::Msg>),
}

/// Replace the unknown deadline on a driver-level timeout with `timeout`
fn with_deadline(err: CacheError, timeout: Duration) -> CacheError {
    match err {
        CacheError::Timeout(_) => CacheError::Timeout(timeout),
        other => other,
    }
}

async fn open_subscription(
    client: &redis::Client,
    channel: &str,
    timeout: Duration,
) -> Result<BoxStream<'static, redis::Msg>, CacheError> {
    let subscribe = async {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok::<_, redis::RedisError>(pubsub.into_on_message().boxed())
    };
    match tokio::time::timeout(timeout, subscribe).await {
        Ok(result) => result.map_err(|e| with_deadline(e.into(), timeout)),
        Err(_) => Err(CacheError::Timeout(timeout)),
    }
}

async fn next_event(
    client: &redis::Client,
    channel: &str,
    timeout: Duration,
    mut state: SubscriptionState,
) -> Option<(SubscriptionEvent, SubscriptionState)> {
    loop {
        state = match state {
            SubscriptionState::Connecting { backoff } => {
                match open_subscription(client, channel, timeout).await {
                    Ok(messages) => {
                        debug!(channel, "Subscribed to channel");
                        return Some((
                            SubscriptionEvent::Subscribed,
                            SubscriptionState::Listening(messages),
                        ));
                    }
                    Err(e) => {
                        warn!(
                            channel,
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "Subscribe failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        SubscriptionState::Connecting {
                            backoff: (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF),
                        }
                    }
                }
            }
            SubscriptionState::Listening(mut messages) => match messages.next().await {
                Some(msg) => match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => {
                        return Some((
                            SubscriptionEvent::Message(payload),
                            SubscriptionState::Listening(messages),
                        ));
                    }
                    Err(e) => {
                        warn!(channel, error = %e, "Failed to read pub/sub payload");
                        SubscriptionState::Listening(messages)
                    }
                },
                None => {
                    warn!(channel, "Pub/sub connection closed");
                    return Some((
                        SubscriptionEvent::Disconnected,
                        SubscriptionState::Connecting {
                            backoff: RESUBSCRIBE_INITIAL_BACKOFF,
                        },
                    ));
                }
            },
        };
    }
}
