//! Durable task queues.

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

/// Prefetch applied by task listeners: one unacknowledged task at a time.
pub const TASK_PREFETCH: u16 = 1;

/// Persistent tasks on the durable queue `p{name}`.
///
/// Unlike [`DirectChannel`](super::DirectChannel), `send_task` declares the queue
/// itself, so tasks sent before any listener exists wait in the broker.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    connection: ConnectionManager,
}

impl TaskQueue {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Declare the durable queue for `name` and publish a persistent task to it.
    pub async fn send_task<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        let queue = Pattern::Task.resource(name);
        let body = codec::encode_payload(payload)?;
        let channel = self.connection.channel().await?;

        channel.declare_queue(&queue, QueueOptions::DURABLE).await?;
        channel
            .publish("", &queue, body, MessageProperties::persistent())
            .await?;
        debug!(queue = %queue, "Task sent");
        Ok(())
    }

    /// Consume tasks for `name` with a prefetch of one.
    pub async fn listen_task<T, F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = Pattern::Task.resource(name);
        let channel = self.connection.channel().await?;
        channel.declare_queue(&queue, QueueOptions::DURABLE).await?;
        channel.prefetch(TASK_PREFETCH).await?;
        consumer::consume(channel, queue, handler).await
    }
}
