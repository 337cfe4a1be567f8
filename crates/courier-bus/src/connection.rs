//! # Connection Manager
//!
//! Owns the single broker connection and channel shared by every operation of a bus.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                          |                  |
//!      +-----------failed---------+                  |
//!      +-------------------close()-------------------+
//! ```
//!
//! - At most one connect attempt is in flight. Concurrent callers await the same
//!   attempt and all observe its outcome.
//! - The attempt runs on its own task, so it completes even if every caller gives up.
//! - `close()` while connecting waits for the attempt to settle, then tears down.

use crate::broker::{Broker, BrokerChannel, BrokerConnection};
use crate::error::BusError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// One connected (transport, channel) pair.
pub struct Session {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Session {
    /// Identifier unique to this connection lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The session's channel.
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<Arc<Session>, BusError>>>;

enum ConnectionState {
    Disconnected,
    Connecting { id: u64, attempt: ConnectAttempt },
    Connected(Arc<Session>),
}

enum CloseStep {
    Done,
    Wait(ConnectAttempt),
    Teardown(Arc<Session>),
}

struct ManagerInner {
    broker: Arc<dyn Broker>,
    url: String,
    state: Mutex<ConnectionState>,
    next_id: AtomicU64,
}

impl ManagerInner {
    async fn establish(&self, id: u64) -> Result<Arc<Session>, BusError> {
        info!(session = id, "Connecting to broker");

        let connection = self
            .broker
            .connect(&self.url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(session = id, error = %close_err, "Failed to close transport after channel error");
                }
                return Err(BusError::Connect(e.to_string()));
            }
        };

        info!(session = id, "Connected to broker");
        Ok(Arc::new(Session {
            id,
            connection,
            channel,
        }))
    }

    /// Record the outcome of attempt `id`, unless the state moved on meanwhile.
    fn settle(&self, id: u64, result: &Result<Arc<Session>, BusError>) {
        let mut state = self.state.lock();
        let current = matches!(&*state, ConnectionState::Connecting { id: current, .. } if *current == id);
        if !current {
            return;
        }
        *state = match result {
            Ok(session) => ConnectionState::Connected(Arc::clone(session)),
            Err(e) => {
                warn!(session = id, error = %e, "Broker connect attempt failed");
                ConnectionState::Disconnected
            }
        };
    }
}

/// Lazy, single-flight owner of the broker connection. Cloning shares the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager that connects to `url` through `broker` on first use.
    pub fn new(broker: Arc<dyn Broker>, url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                broker,
                url: url.into(),
                state: Mutex::new(ConnectionState::Disconnected),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The broker URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> ConnectionStatus {
        match &*self.inner.state.lock() {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
        }
    }

    /// Ensure a connection and channel exist, returning the live session.
    ///
    /// Joins the in-flight attempt if there is one. A failed attempt leaves the
    /// manager disconnected; the next call starts a fresh attempt.
    pub async fn connect(&self) -> Result<Arc<Session>, BusError> {
        let attempt = {
            let mut state = self.inner.state.lock();
            match &*state {
                ConnectionState::Connected(session) => return Ok(Arc::clone(session)),
                ConnectionState::Connecting { attempt, .. } => attempt.clone(),
                ConnectionState::Disconnected => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let attempt = self.start_attempt(id);
                    *state = ConnectionState::Connecting {
                        id,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Alias of [`connect`](Self::connect).
    pub async fn session(&self) -> Result<Arc<Session>, BusError> {
        self.connect().await
    }

    /// The live channel, connecting first if necessary.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let session = self.connect().await?;
        Ok(Arc::clone(session.channel()))
    }

    /// Close the channel, then the connection. No-op when already disconnected.
    pub async fn close(&self) -> Result<(), BusError> {
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                match std::mem::replace(&mut *state, ConnectionState::Disconnected) {
                    ConnectionState::Disconnected => CloseStep::Done,
                    ConnectionState::Connecting { id, attempt } => {
                        *state = ConnectionState::Connecting {
                            id,
                            attempt: attempt.clone(),
                        };
                        CloseStep::Wait(attempt)
                    }
                    ConnectionState::Connected(session) => CloseStep::Teardown(session),
                }
            };

            match step {
                CloseStep::Done => return Ok(()),
                CloseStep::Wait(attempt) => {
                    debug!("Close waiting for in-flight connect attempt");
                    // Either outcome moves the state on; the loop handles both.
                    let _ = attempt.await;
                }
                CloseStep::Teardown(session) => {
                    info!(session = session.id, "Closing broker connection");
                    let channel_closed = session.channel.close().await;
                    let connection_closed = session.connection.close().await;
                    channel_closed?;
                    connection_closed?;
                    return Ok(());
                }
            }
        }
    }

    fn start_attempt(&self, id: u64) -> ConnectAttempt {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.establish(id).await;
            inner.settle(id, &result);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(BusError::Connect(format!("connect task failed: {e}"))))
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status())
            .finish()
    }
}
