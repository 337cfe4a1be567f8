//! Fan-out events.

use crate::broker::{ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::consumer::{self, Subscription};
use crate::error::BusError;
use crate::naming::Pattern;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

/// Events on the fanout exchange `e{name}`. Every subscriber gets every event.
#[derive(Debug, Clone)]
pub struct EventBus {
    connection: ConnectionManager,
}

impl EventBus {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Broadcast `payload` to all current subscribers of `name`.
    pub async fn publish<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        let exchange = Pattern::Event.resource(name);
        let body = codec::encode_payload(payload)?;
        let channel = self.connection.channel().await?;

        channel
            .declare_exchange(&exchange, ExchangeKind::Fanout, ExchangeOptions::TRANSIENT)
            .await?;
        channel
            .publish(&exchange, "", body, MessageProperties::default())
            .await?;
        debug!(exchange = %exchange, "Event published");
        Ok(())
    }

    /// Subscribe to `name` through a private, server-named queue.
    pub async fn subscribe<T, F, Fut>(&self, name: &str, handler: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let exchange = Pattern::Event.resource(name);
        let channel = self.connection.channel().await?;

        channel
            .declare_exchange(&exchange, ExchangeKind::Fanout, ExchangeOptions::TRANSIENT)
            .await?;
        let queue = channel.declare_queue("", QueueOptions::EXCLUSIVE).await?;
        channel.bind_queue(&queue, &exchange, "").await?;
        debug!(exchange = %exchange, queue = %queue, "Subscribed to events");

        consumer::consume(channel, queue, handler).await
    }

    /// Alias of [`publish`](Self::publish).
    pub async fn emit<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        self.publish(name, payload).await
    }

    /// Alias of [`subscribe`](Self::subscribe).
    pub async fn on<T, F, Fut>(&self, name: &str, handler: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(name, handler).await
    }
}
