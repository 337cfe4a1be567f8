//! # Courier Bus - Messaging Patterns over a Shared Broker Connection
//!
//! Four communication patterns on top of a message broker, all sharing one
//! lazily opened connection and channel:
//!
//! | Pattern | Send                | Receive              | Resource          |
//! |---------|---------------------|----------------------|-------------------|
//! | Direct  | `send`              | `listen`             | queue `d{name}`   |
//! | Task    | `send_task`         | `listen_task`        | durable `p{name}` |
//! | Event   | `publish` / `emit`  | `subscribe` / `on`   | fanout `e{name}`  |
//! | RPC     | `call`              | `reply`              | queue `r{name}`   |
//!
//! ## Layout
//!
//! ```text
//!                  ┌──────────────┐
//!                  │  MessageBus  │
//!                  └──────┬───────┘
//!        ┌────────────────┼─────────────────┐
//!        ▼                ▼                 ▼
//!  DirectChannel     RpcClient ──────▶ ReplyMultiplexer
//!  TaskQueue         RpcServer              │
//!  EventBus               │                 │
//!        └────────────────┼─────────────────┘
//!                         ▼
//!                 ConnectionManager ──▶ Broker (memory | amqp)
//! ```
//!
//! ## Guarantees
//!
//! - **Single-flight connect:** concurrent first uses open exactly one connection.
//! - **One reply per call:** a reply, a timeout or a cancellation settles a call, never two.
//! - **One terminal action per served call:** ack and reply, or nack on timeout.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod messaging;
pub mod naming;
pub mod reply;
pub mod rpc;

// Re-export main types
pub use broker::memory::MemoryBroker;
pub use broker::{Broker, BrokerChannel, BrokerConnection};
pub use bus::MessageBus;
pub use config::{format_amqp_url, AmqpConfig, AmqpOptions, BusConfig, ConfigError};
pub use connection::{ConnectionManager, ConnectionStatus, Session};
pub use consumer::Subscription;
pub use error::{BrokerError, BusError, TimeoutError};
pub use naming::Pattern;
pub use reply::{PendingReply, ReplyMultiplexer, ReplyStats};
pub use rpc::{CorrelationId, ReplyEnvelope, RpcClient, RpcServer};

#[cfg(feature = "amqp")]
pub use broker::amqp::AmqpBroker;
