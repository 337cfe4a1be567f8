//! # Broker Collaborator
//!
//! The interface the bus needs from a message broker. Every call is a single
//! request/response round trip that either succeeds or fails; the bus never
//! needs more than one connection and one channel at a time.
//!
//! ## Implementations
//!
//! - [`memory::MemoryBroker`]: in-process broker with AMQP queue and exchange
//!   semantics, used by tests and the demo.
//! - `amqp::AmqpBroker` (feature `amqp`): AMQP 0-9-1 over `lapin`.

use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

/// Broker-assigned identifier of a delivered message, used to ack or nack it.
pub type DeliveryTag = u64;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restart.
    pub durable: bool,
    /// Private to the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// `{durable: true}`
    pub const DURABLE: Self = Self {
        durable: true,
        exclusive: false,
        auto_delete: false,
    };

    /// `{durable: false, autoDelete: true}`
    pub const TRANSIENT: Self = Self {
        durable: false,
        exclusive: false,
        auto_delete: true,
    };

    /// `{exclusive: true}`
    pub const EXCLUSIVE: Self = Self {
        durable: false,
        exclusive: true,
        auto_delete: false,
    };
}

/// Exchange types used by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Copies every message to every bound queue.
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fanout => f.write_str("fanout"),
        }
    }
}

/// Exchange declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeOptions {
    /// `{durable: false, autoDelete: true}`
    pub const TRANSIENT: Self = Self {
        durable: false,
        auto_delete: true,
    };
}

/// Message headers the bus reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Delivery mode 2: written to disk by the broker on durable queues.
    pub persistent: bool,
}

impl MessageProperties {
    /// Properties for a persisted task.
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Self::default()
        }
    }

    /// Properties for an RPC request.
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            persistent: false,
        }
    }

    /// Properties for an RPC reply.
    pub fn reply(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..Self::default()
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the broker delivers the message again after a nack or a closed channel.
    pub redelivered: bool,
}

/// A live consumer: the broker's tag plus the stream of deliveries.
///
/// The stream ends when the consumer is cancelled or the channel closes.
pub struct Consumer {
    pub tag: String,
    pub deliveries: BoxStream<'static, Delivery>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}

/// Entry point of a broker implementation.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a transport connection.
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An open transport connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel: the unit through which all declarations, publishes and consumes flow.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue, returning its name. An empty name asks the broker to pick one.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, BrokerError>;

    /// Declare an exchange.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    /// Publish a message. An empty exchange routes directly to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Limit the number of unacknowledged deliveries per consumer on this channel.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start consuming from a queue with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;

    /// Acknowledge a delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery; the broker requeues it.
    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Cancel a consumer. Deliveries already handed out stay unacknowledged.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), BrokerError>;
}
