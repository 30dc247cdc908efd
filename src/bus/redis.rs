//! Redis-backed broker: pub/sub topics plus the TTL'd key-value store.
//!
//! Publishing and key-value commands go through a [`ConnectionManager`],
//! which transparently reconnects. Subscriptions run a dedicated task that
//! re-establishes the pub/sub connection with exponential backoff, so a
//! broker blip surfaces to consumers as a silent gap rather than a closed
//! stream.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::{KeyValueStore, MessageBus, Subscription};
use crate::error::Result;

/// Initial reconnect delay for a broken pub/sub connection.
const RECONNECT_DELAY_MIN: Duration = Duration::from_millis(200);

/// Reconnect delay ceiling.
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Buffered messages per subscription before backpressure.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// Broker client shared by one worker process.
pub struct RedisBroker {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBroker {
    /// Connect to the broker and verify the connection with a ping.
    ///
    /// # Errors
    ///
    /// Returns a bus error when the URL is invalid or the broker refuses the
    /// connection; callers treat this as process-fatal at startup.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut manager = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut manager).await?;
        info!("connected to broker at {url}");
        Ok(Self { client, manager })
    }
}

#[async_trait::async_trait]
impl MessageBus for RedisBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize> {
        let mut conn = self.manager.clone();
        let subscriber_count: i64 = conn.publish(topic, payload.as_ref()).await?;
        Ok(subscriber_count.max(0) as usize)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel::<Bytes>(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let topic = topic.to_owned();

        tokio::spawn(async move {
            let mut delay = RECONNECT_DELAY_MIN;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(&topic).await {
                            warn!("subscribe to '{topic}' failed: {e}; retrying in {delay:?}");
                        } else {
                            delay = RECONNECT_DELAY_MIN;
                            let mut messages = pubsub.into_on_message();
                            while let Some(msg) = messages.next().await {
                                let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                                if tx.send(payload).await.is_err() {
                                    // Subscriber dropped; tear the task down.
                                    return;
                                }
                            }
                            warn!("pub/sub stream for '{topic}' ended; reconnecting");
                        }
                    }
                    Err(e) => {
                        warn!("broker pub/sub connection failed: {e}; retrying in {delay:?}");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_DELAY_MAX);
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value.as_ref()).await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key, value.as_ref(), ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }
}
