//! AMQP 0-9-1 adapter (RabbitMQ) on top of `lapin`.

use super::{
    Broker, BrokerChannel, BrokerConnection, Consumer, Delivery, DeliveryTag, ExchangeKind,
    ExchangeOptions, MessageProperties, QueueOptions,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivery mode flag for messages the broker writes to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

fn channel_error(e: lapin::Error) -> BrokerError {
    match e {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Closed
        }
        other => BrokerError::Channel(other.to_string()),
    }
}

fn to_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|s| s.to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    }
}

fn from_properties(props: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = props.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = props.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    basic
}

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker).
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (client name, executor, ...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                from_properties(properties),
            )
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        let tag = consumer.tag().as_str().to_string();

        let queue = queue.to_string();
        let deliveries = consumer
            .filter_map(move |delivery| {
                let delivery = match delivery {
                    Ok(delivery) => Some(Delivery {
                        tag: delivery.delivery_tag,
                        properties: to_properties(&delivery.properties),
                        redelivered: delivery.redelivered,
                        body: delivery.data,
                    }),
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "AMQP consumer error");
                        None
                    }
                };
                futures::future::ready(delivery)
            })
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(channel_error)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(channel_error)
    }
}
