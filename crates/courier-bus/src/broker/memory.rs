//! # In-Memory Broker
//!
//! A process-local broker with the queue and exchange semantics the bus relies on:
//!
//! - the default exchange (`""`) routes by queue name; unroutable messages are dropped
//! - fanout exchanges copy each message to every bound queue
//! - an empty queue name yields a server-named queue (`amq.gen-…`)
//! - exclusive queues belong to their connection and are deleted with it
//! - auto-delete queues are deleted when their last consumer is cancelled
//! - deliveries are round-robin across consumers, bounded by per-consumer prefetch
//! - nacked deliveries, and deliveries unacked when a channel closes, are requeued
//!
//! It also records what happened (connects, closes, published messages, acks and
//! nacks per queue) and can inject connect failures or connect latency, which is
//! what the tests use it for. Meant for tests and the demo, not as a production
//! broker: everything lives in process memory. The publish log keeps only the
//! most recent [`PUBLISH_LOG_CAPACITY`] messages; ack and nack tallies are plain
//! counters per queue.

use super::{
    Broker, BrokerChannel, BrokerConnection, Consumer, Delivery, DeliveryTag, ExchangeKind,
    ExchangeOptions, MessageProperties, QueueOptions,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

/// Messages kept in the publish log by [`MemoryBroker::new`].
pub const PUBLISH_LOG_CAPACITY: usize = 1024;

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    /// The body parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Lifecycle counters.
#[derive(Debug, Default)]
struct BrokerStats {
    connects: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    connections_closed: AtomicUsize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    prefetch: u16,
    unacked: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }
}

struct QueueEntry {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct ExchangeEntry {
    bindings: Vec<String>,
    auto_delete: bool,
}

struct ChannelEntry {
    connection: u64,
    prefetch: u16,
}

struct Unacked {
    queue: String,
    channel: u64,
    consumer: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueEntry>,
    exchanges: HashMap<String, ExchangeEntry>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: DeliveryTag,
    published: VecDeque<PublishedMessage>,
    publish_log_capacity: usize,
    published_total: usize,
    acks: HashMap<String, usize>,
    nacks: HashMap<String, usize>,
}

impl BrokerState {
    fn channel(&self, id: u64) -> Result<&ChannelEntry, BrokerError> {
        self.channels.get(&id).ok_or(BrokerError::Closed)
    }

    fn check_owner(queue: &QueueEntry, name: &str, connection: u64) -> Result<(), BrokerError> {
        match queue.owner {
            Some(owner) if owner != connection => Err(BrokerError::ResourceLocked(format!(
                "exclusive queue '{name}' belongs to another connection"
            ))),
            _ => Ok(()),
        }
    }

    fn declare_queue(
        &mut self,
        channel: u64,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let connection = self.channel(channel)?.connection;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = self.queues.get(&name) {
            Self::check_owner(existing, &name, connection)?;
            return Ok(name);
        }

        self.queues.insert(
            name.clone(),
            QueueEntry {
                options,
                owner: options.exclusive.then_some(connection),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        debug!(queue = %name, ?options, "Queue declared");
        Ok(name)
    }

    fn declare_exchange(
        &mut self,
        channel: u64,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.channel(channel)?;
        if name.is_empty() {
            return Err(BrokerError::Channel(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }
        self.exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeEntry {
                bindings: Vec::new(),
                auto_delete: options.auto_delete,
            });
        Ok(())
    }

    fn bind_queue(&mut self, channel: u64, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.channel(channel)?;
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        let entry = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;
        if !entry.bindings.iter().any(|b| b == queue) {
            entry.bindings.push(queue.to_string());
        }
        Ok(())
    }

    fn publish(
        &mut self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.channel(channel)?;

        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            self.exchanges
                .get(exchange)
                .map(|e| e.bindings.clone())
                .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?
        };

        if targets.is_empty() {
            trace!(exchange, routing_key, "Unroutable message dropped");
        }

        for queue in &targets {
            if let Some(entry) = self.queues.get_mut(queue) {
                entry.messages.push_back(StoredMessage {
                    body: body.clone(),
                    properties: properties.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(queue);
        }

        self.published_total += 1;
        if self.publish_log_capacity > 0 {
            if self.published.len() == self.publish_log_capacity {
                self.published.pop_front();
            }
            self.published.push_back(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body,
                properties,
            });
        }
        Ok(())
    }

    fn consume(
        &mut self,
        channel: u64,
        queue: &str,
        tag: String,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let (connection, prefetch) = {
            let entry = self.channel(channel)?;
            (entry.connection, entry.prefetch)
        };
        let entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        Self::check_owner(entry, queue, connection)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        entry.consumers.push(ConsumerEntry {
            tag,
            channel,
            prefetch,
            unacked: 0,
            sender,
        });
        self.dispatch(queue);
        Ok(receiver)
    }

    /// Hand ready messages to consumers with spare prefetch capacity, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|idx| queue.consumers[*idx].has_capacity())
            else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery {
                tag,
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            let consumer = &mut queue.consumers[idx];
            if consumer.sender.send(delivery).is_err() {
                // Receiver dropped without a cancel: forget the consumer.
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            }
            consumer.unacked += 1;
            let unacked = Unacked {
                queue: queue_name.to_string(),
                channel: consumer.channel,
                consumer: consumer.tag.clone(),
                message,
            };
            queue.next_consumer = (idx + 1) % count;
            self.unacked.insert(tag, unacked);
        }
    }

    fn settle(&mut self, channel: u64, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        self.channel(channel)?;
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::NotFound(format!("delivery tag {tag}")))?;
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.tag == entry.consumer) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
        }
        Ok(entry)
    }

    fn ack(&mut self, channel: u64, tag: DeliveryTag) -> Result<(), BrokerError> {
        let entry = self.settle(channel, tag)?;
        *self.acks.entry(entry.queue.clone()).or_default() += 1;
        self.dispatch(&entry.queue);
        Ok(())
    }

    fn nack(&mut self, channel: u64, tag: DeliveryTag) -> Result<(), BrokerError> {
        let entry = self.settle(channel, tag)?;
        *self.nacks.entry(entry.queue.clone()).or_default() += 1;
        self.requeue(entry);
        Ok(())
    }

    fn requeue(&mut self, entry: Unacked) {
        let Unacked {
            queue, mut message, ..
        } = entry;
        if let Some(target) = self.queues.get_mut(&queue) {
            message.redelivered = true;
            target.messages.push_front(message);
        }
        self.dispatch(&queue);
    }

    fn cancel(&mut self, channel: u64, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel(channel)?;
        let queue_name = self
            .queues
            .iter()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("consumer '{consumer_tag}'")))?;

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.consumers.retain(|c| c.tag != consumer_tag);
            queue.next_consumer = 0;
            if queue.options.auto_delete && queue.consumers.is_empty() {
                self.delete_queue(&queue_name);
            }
        }
        debug!(consumer = consumer_tag, queue = %queue_name, "Consumer cancelled");
        Ok(())
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.exchanges.retain(|_, exchange| {
            let bound = exchange.bindings.len();
            exchange.bindings.retain(|b| b != name);
            let unbound_last = bound > 0 && exchange.bindings.is_empty();
            !(exchange.auto_delete && unbound_last)
        });
        debug!(queue = %name, "Queue deleted");
    }

    fn close_channel(&mut self, channel: u64) -> Result<(), BrokerError> {
        self.channels.remove(&channel).ok_or(BrokerError::Closed)?;

        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel);
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }

        let tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.requeue(entry);
            }
        }

        for name in emptied {
            self.delete_queue(&name);
        }
        Ok(())
    }

    fn close_connection(&mut self, connection: u64) -> Result<(), BrokerError> {
        if !self.connections.remove(&connection) {
            return Err(BrokerError::Closed);
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel)?;
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
        Ok(())
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    stats: BrokerStats,
    ids: AtomicU64,
    failing_connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker that logs the last [`PUBLISH_LOG_CAPACITY`] publishes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_publish_log_capacity(PUBLISH_LOG_CAPACITY)
    }

    /// Create an empty broker whose publish log holds at most `capacity` messages.
    /// Zero disables the log.
    #[must_use]
    pub fn with_publish_log_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    publish_log_capacity: capacity,
                    ..BrokerState::default()
                }),
                stats: BrokerStats::default(),
                ids: AtomicU64::new(0),
                failing_connects: AtomicUsize::new(0),
                connect_delay: Mutex::new(None),
            }),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Delay every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Number of transport connect calls made so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.inner.stats.connects.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.inner.stats.channels_opened.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> usize {
        self.inner.stats.channels_closed.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.stats.connections_closed.load(Ordering::SeqCst)
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// The most recently published messages, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().published.iter().cloned().collect()
    }

    /// Number of messages published so far, including those the log no longer holds.
    pub fn published_count(&self) -> usize {
        self.inner.state.lock().published_total
    }

    /// Messages published to the default exchange with `routing_key` as target queue.
    pub fn published_to_queue(&self, queue: &str) -> Vec<PublishedMessage> {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange.is_empty() && m.routing_key == queue)
            .cloned()
            .collect()
    }

    /// Messages published to `exchange`.
    pub fn published_to_exchange(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Number of acks for deliveries taken from `queue`.
    pub fn acks(&self, queue: &str) -> usize {
        self.inner.state.lock().acks.get(queue).copied().unwrap_or(0)
    }

    /// Number of nacks for deliveries taken from `queue`.
    pub fn nacks(&self, queue: &str) -> usize {
        self.inner.state.lock().nacks.get(queue).copied().unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Options the queue was declared with.
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.inner.state.lock().queues.get(queue).map(|q| q.options)
    }

    /// Messages waiting in `queue` (not yet delivered).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.inner.state.lock().exchanges.contains_key(exchange)
    }

    /// Names of server-generated queues currently alive.
    pub fn generated_queues(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .queues
            .keys()
            .filter(|name| name.starts_with("amq.gen-"))
            .cloned()
            .collect()
    }

    /// Deliver a message straight into `queue`, bypassing any connection.
    pub fn inject(&self, queue: &str, body: Vec<u8>, properties: MessageProperties) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.messages.push_back(StoredMessage {
                body,
                properties,
                redelivered: false,
            });
        }
        state.dispatch(queue);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.inner.stats.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let refused = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connection(format!("connection to {url} refused")));
        }

        let id = self.inner.next_id();
        self.inner.state.lock().connections.insert(id);
        debug!(connection = id, url, "Memory broker connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let id = self.inner.next_id();
        {
            let mut state = self.inner.state.lock();
            if !state.connections.contains(&self.id) {
                return Err(BrokerError::Closed);
            }
            state.channels.insert(
                id,
                ChannelEntry {
                    connection: self.id,
                    prefetch: 0,
                },
            );
        }
        self.inner.stats.channels_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryChannel {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.state.lock().close_connection(self.id)?;
        self.inner.stats.connections_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        self.inner.state.lock().declare_queue(self.id, name, options)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        _kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.inner.state.lock().declare_exchange(self.id, name, options)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        _pattern: &str,
    ) -> Result<(), BrokerError> {
        self.inner.state.lock().bind_queue(self.id, queue, exchange)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.inner
            .state
            .lock()
            .publish(self.id, exchange, routing_key, body, properties)
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        let channel = state.channels.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let tag = format!("amq.ctag-{}", self.inner.next_id());
        let receiver = self
            .inner
            .state
            .lock()
            .consume(self.id, queue, tag.clone())?;
        Ok(Consumer {
            tag,
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.state.lock().ack(self.id, tag)
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.state.lock().nack(self.id, tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner.state.lock().cancel(self.id, consumer_tag)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.state.lock().close_channel(self.id)?;
        self.inner.stats.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
