//! # Reply Multiplexer
//!
//! One anonymous, exclusive reply queue per connection lifetime, shared by every
//! RPC call made through the bus. Replies are routed back to the waiting caller
//! by their correlation id.
//!
//! ## Guarantees
//!
//! - The reply queue is declared at most once per session, even under concurrent calls.
//! - A listener fires at most once. Dispatch removes the entry before sending, and
//!   dropping or cancelling a [`PendingReply`] removes it as well.
//! - Replies nobody waits for are dropped and counted as orphaned.

use crate::broker::{BrokerChannel, Delivery, QueueOptions};
use crate::codec;
use crate::connection::{ConnectionManager, Session};
use crate::error::BusError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Decoded reply body, or the reason no reply will arrive.
pub type ReplyResult = Result<Value, BusError>;

/// Counters describing reply traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyStats {
    /// Listeners registered.
    pub registered: u64,
    /// Replies handed to a listener.
    pub dispatched: u64,
    /// Replies with no listener.
    pub orphaned: u64,
    /// Listeners removed without a reply (timeout, cancel or drop).
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    dispatched: AtomicU64,
    orphaned: AtomicU64,
    cancelled: AtomicU64,
}

struct Listener {
    /// Reply queue the caller named in its request.
    queue: String,
    sender: oneshot::Sender<ReplyResult>,
}

type DeclareAttempt = Shared<BoxFuture<'static, Result<String, BusError>>>;

enum ReplyQueueState {
    Idle,
    Declaring { session: u64, attempt: DeclareAttempt },
    Ready { session: u64, queue: String },
}

struct MuxInner {
    state: Mutex<ReplyQueueState>,
    pending: DashMap<String, Listener>,
    counters: Counters,
}

impl MuxInner {
    async fn declare(self: Arc<Self>, session: Arc<Session>) -> Result<String, BusError> {
        let channel = Arc::clone(session.channel());
        let queue = channel.declare_queue("", QueueOptions::EXCLUSIVE).await?;
        let consumer = channel.consume(&queue).await?;
        debug!(session = session.id(), queue = %queue, "Reply queue ready");

        let inner = Arc::clone(&self);
        let consumed = queue.clone();
        tokio::spawn(async move {
            inner.consume(channel, consumed, consumer.deliveries).await;
        });
        Ok(queue)
    }

    async fn consume(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: String,
        mut deliveries: BoxStream<'static, Delivery>,
    ) {
        while let Some(delivery) = deliveries.next().await {
            if let Err(e) = channel.ack(delivery.tag).await {
                error!(queue = %queue, error = %e, "Failed to ack reply");
            }
            self.dispatch(delivery);
        }

        debug!(queue = %queue, "Reply consumer ended");
        {
            let mut state = self.state.lock();
            if matches!(&*state, ReplyQueueState::Ready { queue: q, .. } if *q == queue) {
                *state = ReplyQueueState::Idle;
            }
        }
        // Waiters on this queue can no longer be answered; dropping their senders wakes them.
        self.pending
            .retain(|_, listener| listener.queue != queue);
    }

    fn dispatch(&self, delivery: Delivery) {
        let Some(correlation_id) = delivery.properties.correlation_id else {
            self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping reply without correlation id");
            return;
        };

        let Some((_, listener)) = self.pending.remove(&correlation_id) else {
            self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %correlation_id, "Dropping reply with no waiting caller");
            return;
        };

        let reply = codec::decode::<Value>(&delivery.body);
        if listener.sender.send(reply).is_err() {
            // Caller went away between lookup and send.
            self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(correlation_id = %correlation_id, "Reply dispatched");
    }
}

/// Shared reply queue plus the table of callers waiting on it. Cloning shares both.
#[derive(Clone)]
pub struct ReplyMultiplexer {
    connection: ConnectionManager,
    inner: Arc<MuxInner>,
}

impl ReplyMultiplexer {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            inner: Arc::new(MuxInner {
                state: Mutex::new(ReplyQueueState::Idle),
                pending: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Name of the reply queue for the current session, declaring it on first use.
    pub async fn reply_queue(&self) -> Result<String, BusError> {
        let session = self.connection.session().await?;
        let attempt = {
            let mut state = self.inner.state.lock();
            match &*state {
                ReplyQueueState::Ready { session: id, queue } if *id == session.id() => {
                    return Ok(queue.clone());
                }
                ReplyQueueState::Declaring { session: id, attempt } if *id == session.id() => {
                    attempt.clone()
                }
                _ => {
                    let attempt = self.start_declare(Arc::clone(&session));
                    *state = ReplyQueueState::Declaring {
                        session: session.id(),
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Register a one-shot listener for `correlation_id` on `reply_queue`.
    ///
    /// `reply_queue` is the name returned by [`reply_queue`](Self::reply_queue).
    /// Fails with [`BusError::DuplicateCorrelation`] if a listener is already
    /// waiting, and with [`BusError::ReplyChannelClosed`] if that queue's
    /// consumer has already ended.
    pub fn wait_for_reply(
        &self,
        reply_queue: &str,
        correlation_id: &str,
    ) -> Result<PendingReply, BusError> {
        let (sender, receiver) = oneshot::channel();
        match self.inner.pending.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(BusError::DuplicateCorrelation(correlation_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Listener {
                    queue: reply_queue.to_string(),
                    sender,
                });
            }
        }

        // Checked after inserting: a consumer that ends from here on sweeps the entry itself.
        let live = matches!(
            &*self.inner.state.lock(),
            ReplyQueueState::Ready { queue, .. } if queue == reply_queue
        );
        if !live {
            self.inner.pending.remove(correlation_id);
            debug!(queue = %reply_queue, correlation_id, "Reply queue gone before registration");
            return Err(BusError::ReplyChannelClosed);
        }
        self.inner.counters.registered.fetch_add(1, Ordering::Relaxed);

        Ok(PendingReply {
            correlation_id: correlation_id.to_string(),
            receiver,
            inner: Arc::clone(&self.inner),
            settled: false,
        })
    }

    /// Number of callers currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn stats(&self) -> ReplyStats {
        let counters = &self.inner.counters;
        ReplyStats {
            registered: counters.registered.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            orphaned: counters.orphaned.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
        }
    }

    fn start_declare(&self, session: Arc<Session>) -> DeclareAttempt {
        let inner = Arc::clone(&self.inner);
        let session_id = session.id();
        let task = tokio::spawn(async move {
            let result = Arc::clone(&inner).declare(session).await;
            let mut state = inner.state.lock();
            let current = matches!(&*state, ReplyQueueState::Declaring { session, .. } if *session == session_id);
            if current {
                *state = match &result {
                    Ok(queue) => ReplyQueueState::Ready {
                        session: session_id,
                        queue: queue.clone(),
                    },
                    Err(_) => ReplyQueueState::Idle,
                };
            }
            drop(state);
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(BusError::Connect(format!("reply queue task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }
}

/// A registered reply listener. Resolves with the decoded reply body.
///
/// Dropping it (for example when a timeout wins the race) removes the listener.
#[must_use = "dropping a PendingReply unregisters it"]
pub struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<ReplyResult>,
    inner: Arc<MuxInner>,
    settled: bool,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Stop waiting. A reply arriving later is dropped as orphaned.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if self.inner.pending.remove(&self.correlation_id).is_some() {
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Future for PendingReply {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(reply)) => {
                this.settled = true;
                Poll::Ready(reply)
            }
            Poll::Ready(Err(_)) => {
                this.settled = true;
                Poll::Ready(Err(BusError::ReplyChannelClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.release();
    }
}
