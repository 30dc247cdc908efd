//! Broker abstractions: topic pub/sub and a key-value store with TTL.
//!
//! The pipeline never talks to the broker implementation directly; workers
//! hold `Arc<dyn MessageBus>` / `Arc<dyn KeyValueStore>` so tests and
//! single-process deployments can run on the in-memory broker while
//! production uses Redis.
//!
//! Ordering contract: within a single subscription, messages arrive in
//! publish order. No ordering is guaranteed across distinct subscribers of
//! the same topic.

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::Result;

/// Stream of raw payloads from one topic subscription.
pub type Subscription = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Fire-and-forget topic pub/sub.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload; returns the number of subscribers that received it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize>;

    /// Subscribe to a topic. The stream ends only when the broker connection
    /// is permanently lost.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Key-value store with per-key TTL.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Publish a JSON-serializable event, logging (not propagating) encode
/// failures the way workers treat malformed peer payloads.
pub async fn publish_json<T: serde::Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    event: &T,
) -> Result<usize> {
    let payload = serde_json::to_vec(event)?;
    bus.publish(topic, Bytes::from(payload)).await
}
