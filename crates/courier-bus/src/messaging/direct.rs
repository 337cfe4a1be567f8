//! Fire-and-forget messages to a named queue.

use crate::broker::{MessageProperties, QueueOptions};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::consumer::{self, Subscription};
use crate::error::BusError;
use crate::naming::Pattern;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

/// Direct messages: `send` publishes to `d{name}`, `listen` consumes it.
///
/// Nothing is persisted. Messages sent while no listener has declared the
/// queue are dropped by the broker.
#[derive(Debug, Clone)]
pub struct DirectChannel {
    connection: ConnectionManager,
}

impl DirectChannel {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Publish `payload` to the queue for `name`.
    pub async fn send<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        let queue = Pattern::Direct.resource(name);
        let body = codec::encode_payload(payload)?;
        let channel = self.connection.channel().await?;

        channel
            .publish("", &queue, body, MessageProperties::default())
            .await?;
        debug!(queue = %queue, "Direct message sent");
        Ok(())
    }

    /// Consume the queue for `name`, calling `handler` for each message.
    ///
    /// Several listeners on the same name share the messages round-robin.
    pub async fn listen<T, F, Fut>(&self, name: &str, handler: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = Pattern::Direct.resource(name);
        let channel = self.connection.channel().await?;
        channel.declare_queue(&queue, QueueOptions::TRANSIENT).await?;
        consumer::consume(channel, queue, handler).await
    }
}
