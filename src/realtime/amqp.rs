use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures_lite::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ChangeOrigin, ChannelHealth, OrderChange, RealtimeChannel, Subscription};

const SUBSCRIBER_BUFFER: usize = 64;

fn routing_key(store_id: Uuid) -> String {
    format!("orders.{}", store_id)
}

/// RabbitMQ-backed bus. Each change is published to a topic exchange under `orders.<store_id>`.
pub struct AmqpBus {
    connection: Connection,
    publisher: Channel,
    exchange: String,
    subscribe_timeout: Duration,
}

impl AmqpBus {
    pub async fn connect(url: &str, exchange: &str, subscribe_timeout: Duration) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("Failed to connect to AMQP broker")?;
        let publisher = connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;
        declare_exchange(&publisher, exchange).await?;
        info!("Connected to AMQP exchange {}", exchange);

        Ok(Self {
            connection,
            publisher,
            exchange: exchange.to_string(),
            subscribe_timeout,
        })
    }

    async fn open_consumer(&self, store_id: Uuid) -> Result<lapin::Consumer> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;
        declare_exchange(&channel, &self.exchange).await?;

        let queue = channel
            .queue_declare(
                "".into(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare subscriber queue")?;
        channel
            .queue_bind(
                queue.name().as_str().into(),
                self.exchange.as_str().into(),
                routing_key(store_id).as_str().into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to bind subscriber queue")?;

        channel
            .basic_consume(
                queue.name().as_str().into(),
                format!("driver-session-{}", Uuid::new_v4()).as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consuming")
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange.into(),
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("Failed to declare exchange {}", exchange))
}

impl RealtimeChannel for AmqpBus {
    fn publish(&self, change: OrderChange) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let key = routing_key(change.order.store_id);
            let payload = serde_json::to_vec(&change).context("Failed to serialize change")?;
            self.publisher
                .basic_publish(
                    self.exchange.as_str().into(),
                    key.as_str().into(),
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default().with_content_type("application/json".into()),
                )
                .await
                .context("Failed to publish change")?
                .await
                .context("Broker did not confirm change")?;
            Ok(())
        })
    }

    fn subscribe(&self, store_id: Uuid) -> BoxFuture<'_, Result<Subscription>> {
        Box::pin(async move {
            let (health_tx, health_rx) = watch::channel(ChannelHealth::Subscribing);
            let (events_tx, events_rx) = mpsc::channel(SUBSCRIBER_BUFFER);

            let mut consumer =
                match tokio::time::timeout(self.subscribe_timeout, self.open_consumer(store_id))
                    .await
                {
                    Ok(Ok(consumer)) => consumer,
                    Ok(Err(err)) => {
                        warn!("Subscribing to store {} failed: {:#}", store_id, err);
                        health_tx.send_replace(ChannelHealth::Errored);
                        let task = tokio::spawn(async {});
                        return Ok(Subscription::new(store_id, events_rx, health_rx, task));
                    }
                    Err(_) => {
                        warn!("Subscribing to store {} timed out", store_id);
                        health_tx.send_replace(ChannelHealth::TimedOut);
                        let task = tokio::spawn(async {});
                        return Ok(Subscription::new(store_id, events_rx, health_rx, task));
                    }
                };

            health_tx.send_replace(ChannelHealth::Subscribed);
            info!("Subscribed to store {} changes over AMQP", store_id);

            let task = tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    let delivery = match delivery {
                        Ok(delivery) => delivery,
                        Err(err) => {
                            error!("AMQP consumer for store {} failed: {}", store_id, err);
                            health_tx.send_replace(ChannelHealth::Errored);
                            return;
                        }
                    };

                    match serde_json::from_slice::<OrderChange>(&delivery.data) {
                        Ok(mut change) => {
                            change.origin = ChangeOrigin::Bus;
                            if events_tx.send(change).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("Dropping malformed change: {}", err),
                    }

                    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                        warn!("Failed to ack change: {}", err);
                    }
                }
                health_tx.send_replace(ChannelHealth::Closed);
            });

            Ok(Subscription::new(store_id, events_rx, health_rx, task))
        })
    }
}
