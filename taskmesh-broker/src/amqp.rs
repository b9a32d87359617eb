//! Production `Broker` implementation over AMQP 0-9-1, using `lapin`. Owns
//! one long-lived connection; reconnects transparently on loss (§4.2).

use crate::error::BrokerError;
use crate::payload::TaskPayload;
use crate::{Delivery, DeliveryStream};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use taskmesh_common::config::BrokerConfig;
use taskmesh_common::ids::WorkerId;
use taskmesh_common::retry::{retry_with_backoff, BackoffPolicy};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const EXCHANGE: &str = "tasks.exchange";

fn routing_key(worker: WorkerId) -> String {
    format!("executor.{worker}")
}

pub struct AmqpBroker {
    config: BrokerConfig,
    connection: Mutex<Option<Connection>>,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    /// Returns a channel on the shared connection, reconnecting with
    /// exponential backoff (5 attempts, 2s initial delay, ×2) if the
    /// connection has dropped or was never established.
    async fn channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.create_channel().await?);
            }
            warn!("amqp connection no longer reports connected, reconnecting");
        }

        let uri = self.config.amqp_uri();
        let conn = retry_with_backoff(BackoffPolicy::broker_reconnect(), || {
            let uri = uri.clone();
            async move {
                Connection::connect(&uri, ConnectionProperties::default())
                    .await
                    .map_err(|_| BrokerError::ReconnectExhausted)
            }
        })
        .await?;

        let channel = conn.create_channel().await?;
        *guard = Some(conn);
        Ok(channel)
    }

    async fn declare_topology(&self, channel: &Channel, worker: WorkerId) -> Result<(), BrokerError> {
        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue_name = format!("executor.{worker}");
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                &queue_name,
                EXCHANGE,
                &routing_key(worker),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl crate::Broker for AmqpBroker {
    async fn declare_worker_queue(&self, worker: WorkerId) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        self.declare_topology(&channel, worker).await
    }

    async fn publish(&self, worker: WorkerId, payload: &TaskPayload) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        self.declare_topology(&channel, worker).await?;

        let body = serde_json::to_vec(payload)
            .map_err(|e| BrokerError::InvalidPayload(e.to_string()))?;

        channel
            .basic_publish(
                EXCHANGE,
                &routing_key(worker),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;

        debug!(%worker, "published task payload");
        Ok(())
    }

    async fn consume(&self, worker: WorkerId) -> Result<DeliveryStream, BrokerError> {
        let channel = self.channel().await?;
        self.declare_topology(&channel, worker).await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;

        let queue_name = format!("executor.{worker}");
        let consumer = channel
            .basic_consume(
                &queue_name,
                &format!("taskmesh-worker-{worker}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(move |delivery| match delivery {
            Ok(delivery) => {
                let payload: TaskPayload = serde_json::from_slice(&delivery.data)
                    .map_err(|e| BrokerError::InvalidPayload(e.to_string()))?;
                Ok(Box::new(AmqpDelivery { delivery, payload }) as Box<dyn Delivery>)
            }
            Err(err) => Err(BrokerError::from(err)),
        });

        Ok(Box::pin(stream))
    }

    async fn purge_worker_queue(&self, worker: WorkerId) -> Result<u32, BrokerError> {
        let channel = self.channel().await?;
        self.declare_topology(&channel, worker).await?;
        let queue_name = format!("executor.{worker}");
        let purged = channel
            .queue_purge(&queue_name, QueuePurgeOptions::default())
            .await?;
        Ok(purged)
    }
}

struct AmqpDelivery {
    delivery: lapin::message::Delivery,
    payload: TaskPayload,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
