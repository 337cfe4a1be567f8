//! Handler side of RPC.

use super::{ReplyEnvelope, RPC_PREFETCH};
use crate::broker::{BrokerChannel, Delivery, MessageProperties, QueueOptions};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::consumer::Subscription;
use crate::error::BusError;
use crate::naming::Pattern;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Serves calls arriving on `r{name}` queues.
///
/// Every call gets exactly one terminal action:
///
/// - handler finished in time: ack, then reply `[null, result]` or `[error]`
/// - handler still running at the deadline: the handler is dropped and the call
///   is nacked, so the broker redelivers it
#[derive(Clone)]
pub struct RpcServer {
    connection: ConnectionManager,
    timeout: Duration,
}

impl RpcServer {
    pub fn new(connection: ConnectionManager, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
        }
    }

    /// Use a different handler deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Answer calls to `name` with `handler`.
    ///
    /// A request whose payload does not decode into `T` is acked and answered
    /// with `["invalid request payload: …"]`.
    pub async fn reply<T, R, E, F, Fut>(&self, name: &str, handler: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let queue = Pattern::Rpc.resource(name);
        let channel = self.connection.channel().await?;
        channel.declare_queue(&queue, QueueOptions::TRANSIENT).await?;
        channel.prefetch(RPC_PREFETCH).await?;

        let consumer = channel.consume(&queue).await?;
        debug!(queue = %queue, consumer = %consumer.tag, "RPC server started");

        let task = tokio::spawn(serve(
            Arc::clone(&channel),
            queue.clone(),
            consumer.deliveries,
            Arc::new(handler),
            self.timeout,
        ));
        Ok(Subscription::new(queue, consumer.tag, channel, task))
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn serve<T, R, E, F, Fut>(
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    mut deliveries: BoxStream<'static, Delivery>,
    handler: Arc<F>,
    timeout: Duration,
) where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    while let Some(delivery) = deliveries.next().await {
        tokio::spawn(handle_call(
            Arc::clone(&channel),
            queue.clone(),
            delivery,
            Arc::clone(&handler),
            timeout,
        ));
    }
    debug!(queue = %queue, "RPC server stream ended");
}

async fn handle_call<T, R, E, F, Fut>(
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    delivery: Delivery,
    handler: Arc<F>,
    timeout: Duration,
) where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let Delivery {
        tag, body, properties, ..
    } = delivery;

    let payload = match codec::decode::<T>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(queue = %queue, error = %e, "Rejecting RPC call with invalid payload");
            ack(channel.as_ref(), &queue, tag).await;
            let envelope = ReplyEnvelope::Failure(Value::String(format!("invalid request payload: {e}")));
            send_reply(channel.as_ref(), &queue, properties, envelope).await;
            return;
        }
    };

    let outcome = match tokio::time::timeout(timeout, (*handler)(payload)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                queue = %queue,
                correlation_id = properties.correlation_id.as_deref().unwrap_or_default(),
                ?timeout,
                "RPC handler timed out, requeueing call"
            );
            if let Err(e) = channel.nack(tag).await {
                error!(queue = %queue, tag, error = %e, "Failed to nack timed out call");
            }
            return;
        }
    };

    ack(channel.as_ref(), &queue, tag).await;
    let envelope = match outcome {
        Ok(result) => codec::to_value(&result).map(ReplyEnvelope::Success),
        Err(failure) => codec::to_value(&failure).map(ReplyEnvelope::Failure),
    }
    .unwrap_or_else(|e| ReplyEnvelope::Failure(Value::String(e.to_string())));
    send_reply(channel.as_ref(), &queue, properties, envelope).await;
}

async fn ack(channel: &dyn BrokerChannel, queue: &str, tag: u64) {
    if let Err(e) = channel.ack(tag).await {
        error!(queue = %queue, tag, error = %e, "Failed to ack RPC call");
    }
}

async fn send_reply(
    channel: &dyn BrokerChannel,
    queue: &str,
    properties: MessageProperties,
    envelope: ReplyEnvelope,
) {
    let Some(reply_to) = properties.reply_to else {
        warn!(queue = %queue, "RPC call has no reply queue, discarding result");
        return;
    };

    let body = match codec::encode_payload(&envelope.to_value()) {
        Ok(body) => body,
        Err(e) => {
            error!(queue = %queue, error = %e, "Failed to encode RPC reply");
            return;
        }
    };

    let reply = MessageProperties::reply(properties.correlation_id);
    if let Err(e) = channel.publish("", &reply_to, body, reply).await {
        error!(queue = %queue, reply_to = %reply_to, error = %e, "Failed to send RPC reply");
    }
}
