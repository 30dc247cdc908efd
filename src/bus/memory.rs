//! In-process broker: tokio broadcast channels per topic plus a TTL'd map.
//!
//! Used by the test suite and by single-process deployments where all four
//! worker roles run in one binary. Semantics match the Redis broker: per
//! subscriber publish order, no replay for late subscribers, TTL expiry on
//! read.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{KeyValueStore, MessageBus, Subscription};
use crate::error::{PlatformError, Result};

/// Slow consumers may lag this many messages before the broadcast channel
/// drops the oldest for them.
const TOPIC_BUFFER: usize = 1024;

#[derive(Default)]
struct KvEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// In-memory implementation of both broker capabilities.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    kv: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize> {
        // send() errors only when there are no receivers; that is a valid
        // fire-and-forget outcome, not a failure.
        Ok(self.sender(topic).send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let rx = self.sender(topic).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(lagged) => {
                    tracing::warn!("memory bus subscriber lagged: {lagged}");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut kv = self
            .kv
            .lock()
            .map_err(|_| PlatformError::Keystore("kv lock poisoned".to_owned()))?;
        match kv.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    kv.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(entry.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut kv = self
            .kv
            .lock()
            .map_err(|_| PlatformError::Keystore("kv lock poisoned".to_owned()))?;
        kv.insert(
            key.to_owned(),
            KvEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut kv = self
            .kv
            .lock()
            .map_err(|_| PlatformError::Keystore("kv lock poisoned".to_owned()))?;
        kv.insert(
            key.to_owned(),
            KvEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut kv = self
            .kv
            .lock()
            .map_err(|_| PlatformError::Keystore("kv lock poisoned".to_owned()))?;
        kv.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
