//! Pub/sub invalidation listener
//!
//! A background task subscribed to the invalidation channel. Each process
//! runs one, created at startup and stopped at teardown through its
//! [`ListenerHandle`]. Delivery is best-effort and at most once: a missed
//! message only leaves a local copy alive until its TTL runs out.
//!
//! ```text
//! Process A: cache.invalidate("user:1")
//!   ↓
//! PUBLISH smartcache:updates {"key":"user:1","reason":"explicit",...}
//!   ↓
//! Process B: listener evicts "user:1" from its local layer
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::CacheError;
use crate::store::{BackingStore, SubscriptionEvent};

/// Why a key was invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationReason {
    /// Deleted; the next reader recomputes
    Explicit,
    /// Rewritten with a fresh value; readers may warm up eagerly
    Refresh,
}

/// Message carried on the invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub key: String,
    pub reason: InvalidationReason,
    /// Identifies the publishing cache instance
    pub origin_id: String,
}

impl InvalidationMessage {
    pub fn new(
        key: impl Into<String>,
        reason: InvalidationReason,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            reason,
            origin_id: origin_id.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Subscribing,
    Listening,
}

/// Receives decoded invalidation messages
#[async_trait]
pub trait InvalidationHandler: Send + Sync + 'static {
    async fn on_invalidation(&self, message: InvalidationMessage);
}

/// Owner of a running listener task
pub struct ListenerHandle {
    channel: String,
    state: watch::Receiver<ListenerState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Wait until the listener reaches `target`
    pub async fn wait_for_state(&self, target: ListenerState) {
        let mut state = self.watch_state();
        // Err means the task is gone, which only happens once it has stopped
        let _ = state.wait_for(|s| *s == target).await;
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(channel = %self.channel, error = %e, "Invalidation listener task failed");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Subscribe to `channel` and hand every message to `handler` on a
/// background task. Must be called from within a tokio runtime.
pub fn start_listener(
    store: Arc<dyn BackingStore>,
    channel: &str,
    handler: Arc<dyn InvalidationHandler>,
) -> ListenerHandle {
    let (state_tx, state_rx) = watch::channel(ListenerState::Subscribing);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe before spawning so nothing published after this call is missed
    let events = store.subscribe(channel);
    let task = tokio::spawn(run(
        channel.to_owned(),
        events,
        handler,
        state_tx,
        shutdown_rx,
    ));

    ListenerHandle {
        channel: channel.to_owned(),
        state: state_rx,
        shutdown: shutdown_tx,
        task: Some(task),
    }
}

async fn run(
    channel: String,
    mut events: futures::stream::BoxStream<'static, SubscriptionEvent>,
    handler: Arc<dyn InvalidationHandler>,
    state: watch::Sender<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(channel = %channel, "Invalidation listener starting");

    loop {
        let event = tokio::select! {
            // Fires on the shutdown signal or when the handle is gone
            _ = shutdown.changed() => break,
            event = events.next() => event,
        };

        match event {
            Some(SubscriptionEvent::Subscribed) => {
                info!(channel = %channel, "Invalidation listener subscribed");
                state.send_replace(ListenerState::Listening);
            }
            Some(SubscriptionEvent::Disconnected) => {
                warn!(channel = %channel, "Invalidation listener lost its subscription");
                state.send_replace(ListenerState::Subscribing);
            }
            Some(SubscriptionEvent::Message(payload)) => {
                match InvalidationMessage::from_bytes(&payload) {
                    Ok(message) => {
                        debug!(
                            channel = %channel,
                            key = %message.key,
                            reason = ?message.reason,
                            origin_id = %message.origin_id,
                            "Invalidation received"
                        );
                        handler.on_invalidation(message).await;
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Unable to parse invalidation payload");
                    }
                }
            }
            None => {
                warn!(channel = %channel, "Subscription stream ended");
                break;
            }
        }
    }

    state.send_replace(ListenerState::Stopped);
    info!(channel = %channel, "Invalidation listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<InvalidationMessage>>,
    }

    #[async_trait]
    impl InvalidationHandler for Recorder {
        async fn on_invalidation(&self, message: InvalidationMessage) {
            self.seen.lock().unwrap().push(message);
        }
    }

    #[test]
    fn test_message_wire_format() {
        let message = InvalidationMessage::new("user:1", InvalidationReason::Explicit, "p1");
        let bytes = message.to_bytes().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"key":"user:1","reason":"explicit","origin_id":"p1"}"#
        );
        assert_eq!(InvalidationMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[tokio::test]
    async fn test_lifecycle_and_delivery() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let handle = start_listener(Arc::new(store.clone()), "updates", recorder.clone());

        handle.wait_for_state(ListenerState::Listening).await;

        store.publish("updates", b"garbage").await.unwrap();
        let message = InvalidationMessage::new("k", InvalidationReason::Refresh, "other");
        store
            .publish("updates", &message.to_bytes().unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while recorder.seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message delivered");
        assert_eq!(recorder.seen.lock().unwrap().as_slice(), &[message]);

        let mut state = handle.state.clone();
        handle.shutdown().await;
        assert_eq!(*state.borrow_and_update(), ListenerState::Stopped);
    }
}
