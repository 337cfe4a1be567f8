//! # Message Bus
//!
//! One object exposing every messaging pattern over a single lazily opened
//! broker connection.
//!
//! ```no_run
//! # async fn demo() -> Result<(), courier_bus::BusError> {
//! use courier_bus::{BusConfig, MemoryBroker, MessageBus};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! let bus = MessageBus::new(BusConfig::default(), Arc::new(MemoryBroker::new()));
//! bus.reply("echo", |v: Value| async move { Ok::<_, Value>(v) }).await?;
//! let answer: Value = bus.call("echo", &json!({"a": 1})).await?;
//! assert_eq!(answer, json!({"a": 1}));
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::broker::Broker;
use crate::config::BusConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Session};
use crate::consumer::Subscription;
use crate::error::BusError;
use crate::messaging::{DirectChannel, EventBus, TaskQueue};
use crate::reply::{ReplyMultiplexer, ReplyStats};
use crate::rpc::{RpcClient, RpcServer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Facade over the connection, the one-way primitives and RPC.
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Debug, Clone)]
pub struct MessageBus {
    connection: ConnectionManager,
    direct: DirectChannel,
    tasks: TaskQueue,
    events: EventBus,
    client: RpcClient,
    server: RpcServer,
}

impl MessageBus {
    /// Build a bus for `config` on top of `broker`. Nothing connects until first use.
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        let connection = ConnectionManager::new(broker, config.url());
        let replies = ReplyMultiplexer::new(connection.clone());

        Self {
            direct: DirectChannel::new(connection.clone()),
            tasks: TaskQueue::new(connection.clone()),
            events: EventBus::new(connection.clone()),
            client: RpcClient::new(connection.clone(), replies, config.timeout),
            server: RpcServer::new(connection.clone(), config.timeout),
            connection,
        }
    }

    /// Build a bus that talks AMQP 0-9-1 to the broker named in `config`.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: BusConfig) -> Self {
        Self::new(config, Arc::new(crate::broker::amqp::AmqpBroker::new()))
    }

    // ============================================================================
    // Connection
    // ============================================================================

    /// Connect now instead of on first use.
    pub async fn connect(&self) -> Result<Arc<Session>, BusError> {
        self.connection.connect().await
    }

    /// Close the channel and the connection. Subscriptions end with it.
    pub async fn close(&self) -> Result<(), BusError> {
        self.connection.close().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn url(&self) -> &str {
        self.connection.url()
    }

    /// RPC timeout used by `call` and `reply`.
    pub fn timeout(&self) -> Duration {
        self.client.timeout()
    }

    pub fn reply_stats(&self) -> ReplyStats {
        self.client.replies().stats()
    }

    /// Calls waiting for a reply right now.
    pub fn pending_calls(&self) -> usize {
        self.client.replies().pending_count()
    }

    // ============================================================================
    // Direct messages
    // ============================================================================

    pub async fn send<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        self.direct.send(name, payload).await
    }

    pub async fn listen<T, F, Fut>(&self, name: &str, handler: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.direct.listen(name, handler).await
    }

    // ============================================================================
    // Tasks
    // ============================================================================

    pub async fn send_task<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        self.tasks.send_task(name, payload).await
    }

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
        self.tasks.listen_task(name, handler).await
    }

    // ============================================================================
    // Events
    // ============================================================================

    pub async fn publish<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        self.events.publish(name, payload).await
    }

    pub async fn subscribe<T, F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.events.subscribe(name, handler).await
    }

    /// Alias of [`publish`](Self::publish).
    pub async fn emit<P>(&self, name: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        self.events.emit(name, payload).await
    }

    /// Alias of [`subscribe`](Self::subscribe).
    pub async fn on<T, F, Fut>(&self, name: &str, handler: F) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.events.on(name, handler).await
    }

    // ============================================================================
    // RPC
    // ============================================================================

    pub async fn call<P, R>(&self, name: &str, payload: &P) -> Result<R, BusError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.client.call(name, payload).await
    }

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
        self.client.call_with_timeout(name, payload, timeout).await
    }

    pub async fn reply<T, R, E, F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.server.reply(name, handler).await
    }
}
