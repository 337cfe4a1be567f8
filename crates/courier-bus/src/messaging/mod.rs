//! # Messaging Primitives
//!
//! The three one-way patterns, each bound to a queue or exchange derived from a
//! logical name:
//!
//! | Primitive        | Resource | Declared as                         | Delivery                |
//! |------------------|----------|-------------------------------------|-------------------------|
//! | [`DirectChannel`] | `d…`    | queue, transient, auto-delete       | one listener per message |
//! | [`TaskQueue`]     | `p…`    | queue, durable; persistent messages | one listener per message |
//! | [`EventBus`]      | `e…`    | fanout exchange, transient          | every subscriber         |
//!
//! Outbound payloads go through [`codec::encode_payload`](crate::codec::encode_payload),
//! so a falsy payload is sent as `{}`.

pub mod direct;
pub mod event;
pub mod task;

pub use direct::DirectChannel;
pub use event::EventBus;
pub use task::TaskQueue;
