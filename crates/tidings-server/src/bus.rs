//! Fan-out of delivery events between server processes.
//!
//! Every process publishes each stored message once and subscribes to the
//! same topic; its dispatcher then emits into local rooms only. A message
//! therefore reaches a recipient regardless of which process holds their
//! connection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};

use tidings_shared::protocol::BusEnvelope;

use crate::error::TransportError;

/// Depth of a subscriber's local queue.
const SUBSCRIBER_QUEUE: usize = 1024;

#[async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &BusEnvelope) -> Result<(), TransportError>;

    /// Start receiving every envelope published on `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusEnvelope>, TransportError>;
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Bus for a single process; topics are tokio broadcast channels.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusEnvelope>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<BusEnvelope>, TransportError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| TransportError::Bus("topic table poisoned".to_string()))?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_QUEUE).0)
            .clone())
    }
}

#[async_trait]
impl BroadcastBus for LocalBus {
    async fn publish(&self, topic: &str, envelope: &BusEnvelope) -> Result<(), TransportError> {
        // No subscribers is not an error: nobody is connected to deliver to.
        let _ = self.sender(topic)?.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusEnvelope>, TransportError> {
        let mut source = self.sender(topic)?.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%topic, skipped, "bus subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Redis pub/sub bus
// ---------------------------------------------------------------------------

/// Bus shared by every process connected to the same Redis.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(client: redis::Client) -> Result<Self, TransportError> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl BroadcastBus for RedisBus {
    async fn publish(&self, topic: &str, envelope: &BusEnvelope) -> Result<(), TransportError> {
        let payload = envelope.to_json()?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(topic, payload).await?;
        tracing::debug!(%topic, receivers, "published delivery event");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusEnvelope>, TransportError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let client = self.client.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "bus connection failed, retrying in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if let Err(e) = pubsub.subscribe(topic.as_str()).await {
                    tracing::error!(error = %e, %topic, "bus subscribe failed, retrying in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                tracing::info!(%topic, "subscribed to delivery bus");

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::error!(error = %e, "unreadable bus payload");
                            continue;
                        }
                    };
                    let envelope = match BusEnvelope::from_json(&payload) {
                        Ok(env) => env,
                        Err(e) => {
                            tracing::error!(error = %e, "malformed bus envelope");
                            continue;
                        }
                    };
                    if tx.send(envelope).await.is_err() {
                        tracing::debug!(%topic, "bus subscriber dropped, stopping listener");
                        return;
                    }
                }

                tracing::warn!(%topic, "bus stream ended, reconnecting");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(rx)
    }
}
