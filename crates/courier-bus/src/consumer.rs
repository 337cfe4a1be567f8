//! # Consumers
//!
//! Runs a handler over the deliveries of one queue and hands back a
//! [`Subscription`] to stop it.
//!
//! Each delivery is acked as soon as it is taken off the stream, then decoded
//! and passed to the handler. The handler is awaited before the next delivery
//! is taken, so a subscription processes messages one at a time, in order.

use crate::broker::{BrokerChannel, Delivery};
use crate::codec;
use crate::error::BusError;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A live consumer created by `listen`, `listen_task`, `subscribe` or `reply`.
///
/// Dropping the handle leaves the consumer running; call [`cancel`](Self::cancel)
/// to stop it.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(
        queue: String,
        consumer_tag: String,
        channel: Arc<dyn BrokerChannel>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            queue,
            consumer_tag,
            channel,
            task,
        }
    }

    /// The queue being consumed. For event subscriptions this is the private
    /// server-named queue bound to the exchange.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// True once the consumer has stopped (cancelled or connection closed) and
    /// its last handler invocation has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop future deliveries. A handler already running is left to finish.
    pub async fn cancel(self) -> Result<(), BusError> {
        debug!(queue = %self.queue, consumer = %self.consumer_tag, "Cancelling consumer");
        self.channel.cancel(&self.consumer_tag).await?;
        Ok(())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

/// Start consuming `queue` on `channel`, feeding each decoded payload to `handler`.
pub(crate) async fn consume<T, F, Fut>(
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    handler: F,
) -> Result<Subscription, BusError>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let consumer = channel.consume(&queue).await?;
    debug!(queue = %queue, consumer = %consumer.tag, "Consumer started");

    let task = tokio::spawn(run(
        Arc::clone(&channel),
        queue.clone(),
        consumer.deliveries,
        handler,
    ));
    Ok(Subscription::new(queue, consumer.tag, channel, task))
}

async fn run<T, F, Fut>(
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    mut deliveries: BoxStream<'static, Delivery>,
    handler: F,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    while let Some(delivery) = deliveries.next().await {
        if let Err(e) = channel.ack(delivery.tag).await {
            error!(queue = %queue, tag = delivery.tag, error = %e, "Failed to ack delivery");
        }

        match codec::decode::<T>(&delivery.body) {
            Ok(payload) => handler(payload).await,
            Err(e) => warn!(queue = %queue, error = %e, "Skipping undecodable message"),
        }
    }
    debug!(queue = %queue, "Consumer stream ended");
}
