#![cfg(feature = "amqp")]

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use orbit_core::bus::{
    Broker, BrokerSession, BusError, BusLink, BusMessage, BusPublisher, BusTopology,
};

const PERSISTENT: u8 = 2;

/// RabbitMQ (or any AMQP 0.9.1 broker) behind the [`Broker`] seam
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

struct AmqpSession {
    connection: Connection,
}

struct AmqpPublisher {
    channel: Channel,
    exchange: String,
}

fn declare_error(err: lapin::Error) -> BusError {
    BusError::Declare(err.to_string())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BusError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Box::new(AmqpSession { connection }))
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn finalize(self: Box<Self>, topology: &BusTopology) -> Result<BusLink, BusError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(declare_error)?;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;

        channel
            .queue_declare(
                &topology.persistence_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;
        channel
            .queue_bind(
                &topology.persistence_queue,
                &topology.exchange,
                &topology.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;

        // private queue for this agent's own consumer
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;
        channel
            .queue_bind(
                queue.name().as_str(),
                &topology.exchange,
                &topology.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &format!("orbit-agent-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;

        let (tx, rx) = mpsc::channel(256);
        let connection = self.connection;
        tokio::spawn(async move {
            // the connection lives as long as its consumer
            let _connection = connection;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let message = BusMessage {
                            routing_key: delivery.routing_key.as_str().to_string(),
                            payload: delivery.data,
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "AMQP consumer failed");
                        break;
                    }
                }
            }
        });

        Ok(BusLink {
            publisher: Arc::new(AmqpPublisher {
                channel,
                exchange: topology.exchange.clone(),
            }),
            deliveries: rx,
        })
    }
}

#[async_trait]
impl BusPublisher for AmqpPublisher {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }
}
