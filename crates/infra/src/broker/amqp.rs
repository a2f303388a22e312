//! RabbitMQ binding (AMQP 0-9-1 via `lapin`).
//!
//! One [`AmqpConnector::connect`] call opens a dedicated connection and a single channel.
//! Connection-level errors reported by lapin are forwarded to the session's
//! [`ConnectionEvents`]; channel-level failures surface as errors from the next
//! operation and `is_open()` turning false.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, ConnectionEvents, Deliveries,
    Delivery, MessageProperties, QueueOptions,
};

const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ sessions for an `amqp://` URL.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<BrokerSession, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = lost_tx.send(err.to_string());
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        debug!("amqp connection established");

        Ok(BrokerSession {
            channel: Arc::new(AmqpChannel {
                connection,
                channel,
            }),
            events: ConnectionEvents::new(lost_rx),
        })
    }
}

/// A lapin connection with its one channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl std::fmt::Debug for AmqpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("channel_id", &self.channel.id())
            .finish()
    }
}

fn channel_err(e: lapin::Error) -> BrokerError {
    BrokerError::Channel(e.to_string())
}

fn millis(d: Duration) -> AMQPValue {
    AMQPValue::LongLongInt(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = options.message_ttl {
        args.insert(ShortString::from("x-message-ttl"), millis(ttl));
    }
    if let Some(expires) = options.expires {
        args.insert(ShortString::from("x-expires"), millis(expires));
    }
    if let Some(dlx) = &options.dead_letter_exchange {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    if let Some(key) = &options.dead_letter_routing_key {
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(key.as_str())),
        );
    }
    args
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props =
        BasicProperties::default().with_content_type(ShortString::from("application/json"));
    if properties.persistent {
        props = props.with_delivery_mode(2);
    }
    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }
    if let Some(id) = &properties.message_id {
        props = props.with_message_id(ShortString::from(id.as_str()));
    }
    props
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        body: delivery.data,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Topology(e.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_err)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        if tx.send(to_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(consumer_tag = %tag, error = %e, "amqp consumer stream failed");
                        break;
                    }
                }
            }
            debug!(consumer_tag = %tag, "amqp consumer stream ended");
        });

        Ok(Deliveries::new(rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(channel_err)
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(channel_err)?;
        Ok(message.map(|m| to_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_err)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(channel_err)
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(channel_err)?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}
