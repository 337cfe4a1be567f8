//! Caller side of RPC.

use super::{CorrelationId, ReplyEnvelope, RPC_TIMEOUT_MESSAGE};
use crate::broker::MessageProperties;
use crate::codec;
use crate::connection::ConnectionManager;
use crate::error::{BusError, TimeoutError};
use crate::naming::Pattern;
use crate::reply::ReplyMultiplexer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Makes calls to `r{name}` queues and waits for the correlated reply.
#[derive(Clone)]
pub struct RpcClient {
    connection: ConnectionManager,
    replies: ReplyMultiplexer,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(connection: ConnectionManager, replies: ReplyMultiplexer, timeout: Duration) -> Self {
        Self {
            connection,
            replies,
            timeout,
        }
    }

    /// Default time budget per call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn replies(&self) -> &ReplyMultiplexer {
        &self.replies
    }

    /// Call `name` with `payload` using the default timeout.
    ///
    /// # Errors
    ///
    /// - [`BusError::Remote`] with the handler's error value, verbatim
    /// - [`BusError::Timeout`] when no reply arrives in time
    /// - [`BusError::Decode`] when the result does not fit `R`
    pub async fn call<P, R>(&self, name: &str, payload: &P) -> Result<R, BusError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with_timeout(name, payload, self.timeout).await
    }

    /// Call `name` with an explicit time budget.
    pub async fn call_with_timeout<P, R>(
        &self,
        name: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<R, BusError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let queue = Pattern::Rpc.resource(name);
        let body = codec::encode_payload(payload)?;
        let reply_to = self.replies.reply_queue().await?;

        let correlation_id = CorrelationId::new().to_string();
        let pending = self.replies.wait_for_reply(&reply_to, &correlation_id)?;

        let channel = self.connection.channel().await?;
        channel
            .publish(
                "",
                &queue,
                body,
                MessageProperties::request(correlation_id.as_str(), reply_to),
            )
            .await?;
        debug!(queue = %queue, correlation_id = %correlation_id, "RPC call sent");

        // Losing the race drops `pending`, which unregisters the listener.
        let reply = match tokio::time::timeout(timeout, pending).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!(queue = %queue, correlation_id = %correlation_id, ?timeout, "RPC call timed out");
                return Err(TimeoutError::new(RPC_TIMEOUT_MESSAGE).into());
            }
        };

        let result = ReplyEnvelope::from_value(reply)?.into_result()?;
        codec::from_value(result)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}
