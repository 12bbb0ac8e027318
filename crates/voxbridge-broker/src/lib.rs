//! Message broker abstraction.
//!
//! The relay only needs durable named queues with competing consumers and
//! per-delivery acknowledge / reject-and-requeue. Every backend implements
//! the [`Broker`] trait; the AMQP backend is feature-gated.

use std::sync::Arc;

use async_trait::async_trait;

use voxbridge_core::config::{BrokerConfig, BrokerKind};
use voxbridge_core::error::{Result, VoxBridgeError};

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::MemoryBroker;

/// How deliveries from a consumer are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// A message counts as consumed the moment it is delivered.
    Auto,
    /// A message stays outstanding until acked or rejected.
    Manual,
}

/// Resolves a single delivery on the broker side.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub body: Vec<u8>,
    /// True when the message was requeued at least once before this delivery.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    /// Durably remove the message from its queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Decline the message. With `requeue` it becomes available to every
    /// consumer of the queue again, unchanged.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    pub async fn requeue(self) -> Result<()> {
        self.reject(true).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A subscription to one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` once the broker or subscription is
    /// closed. Dropping the returned future before it completes never loses
    /// a message.
    async fn next(&mut self) -> Option<Result<Delivery>>;

    /// Stop the subscription; outstanding unacknowledged deliveries go back
    /// to the queue.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a broker connection, safe to use from concurrent tasks.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Backend identifier ("memory", "amqp").
    fn id(&self) -> &str;

    /// Declare a durable, non-exclusive queue. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Box<dyn Consumer>>;

    async fn close(&self) -> Result<()>;
}

/// Connect to the broker described by `config`.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "amqp")]
        BrokerKind::Amqp => Ok(Arc::new(
            amqp::AmqpBroker::connect(&config.url, config.prefetch).await?,
        )),
        #[cfg(not(feature = "amqp"))]
        BrokerKind::Amqp => Err(VoxBridgeError::Config(
            "broker kind 'amqp' requires building with the 'amqp' feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let broker = connect(&BrokerConfig::default()).await.unwrap();
        assert_eq!(broker.id(), "memory");
    }

    #[cfg(not(feature = "amqp"))]
    #[tokio::test]
    async fn test_connect_amqp_without_feature() {
        let config = BrokerConfig {
            kind: BrokerKind::Amqp,
            ..BrokerConfig::default()
        };
        let err = connect(&config).await.err().unwrap();
        assert!(matches!(err, VoxBridgeError::Config(_)));
    }
}
