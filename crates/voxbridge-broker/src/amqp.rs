//! AMQP 0-9-1 backend (RabbitMQ) built on `lapin`.
//!
//! Publishing goes through the default exchange on one shared channel that
//! is serialized behind an async mutex. Each consumer gets its own channel
//! with `basic_qos(prefetch)`; closing that channel hands any unacknowledged
//! deliveries back to the queue.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use voxbridge_core::error::{Result, VoxBridgeError};

use crate::{AckMode, Acker, Broker, Consumer, Delivery};

fn transport(e: lapin::Error) -> VoxBridgeError {
    VoxBridgeError::Transport(e.to_string())
}

pub struct AmqpBroker {
    connection: Connection,
    publisher: Mutex<Channel>,
    prefetch: u16,
}

impl AmqpBroker {
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(transport)?;
        let publisher = connection.create_channel().await.map_err(transport)?;
        info!(prefetch, "Connected to AMQP broker");

        Ok(Self {
            connection,
            publisher: Mutex::new(publisher),
            prefetch,
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn id(&self) -> &str {
        "amqp"
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        let channel = self.publisher.lock().await;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport)?;
        debug!(queue = name, "Declared queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let channel = self.publisher.lock().await;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(transport)?
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Box<dyn Consumer>> {
        let channel = self.connection.create_channel().await.map_err(transport)?;
        if mode == AckMode::Manual {
            channel
                .basic_qos(self.prefetch, BasicQosOptions::default())
                .await
                .map_err(transport)?;
        }

        let tag = format!("voxbridge-{}", uuid::Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: mode == AckMode::Auto,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport)?;
        debug!(queue, tag = %tag, ?mode, "Consumer registered");

        Ok(Box::new(AmqpConsumer {
            channel,
            consumer,
            mode,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "voxbridge shutting down")
            .await
            .map_err(transport)
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
    mode: AckMode,
    closed: bool,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        if self.closed {
            return None;
        }
        let delivery = self.consumer.next().await?;
        Some(delivery.map_err(transport).map(|d| {
            let acker: Box<dyn Acker> = match self.mode {
                AckMode::Manual => Box::new(AmqpAcker(d.acker)),
                AckMode::Auto => Box::new(NoAck),
            };
            Delivery::new(d.data, d.redelivered, acker)
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel
            .close(200, "consumer closed")
            .await
            .map_err(transport)
    }
}

impl Drop for AmqpConsumer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close(200, "consumer dropped").await {
                        debug!(%e, "Failed to close consumer channel");
                    }
                });
            }
            Err(_) => warn!("Consumer dropped outside a runtime; channel left open"),
        }
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await.map_err(transport)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(transport)
    }
}

struct NoAck;

#[async_trait]
impl Acker for NoAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if requeue {
            return Err(VoxBridgeError::Transport(
                "cannot requeue an auto-acknowledged delivery".into(),
            ));
        }
        Ok(())
    }
}
