//! # Remote Procedure Calls
//!
//! Request/response over two queues:
//!
//! ```text
//!  caller                         broker                          handler
//!    | publish r{name}                |                                |
//!    | {correlationId, replyTo} ----> | -----------------------------> |
//!    |                                |        ack, [null, result]     |
//!    | <----------------------------- | <----- or [error] to replyTo --|
//!    | (or TimeoutError after T)      |        (or nack after T)       |
//! ```
//!
//! The caller side lives in [`client`], the handler side in [`server`]. Replies
//! come back through the shared [`ReplyMultiplexer`](crate::reply::ReplyMultiplexer).

pub mod client;
pub mod correlation;
pub mod envelope;
pub mod server;

pub use client::RpcClient;
pub use correlation::CorrelationId;
pub use envelope::ReplyEnvelope;
pub use server::RpcServer;

/// Message of the [`TimeoutError`](crate::error::TimeoutError) raised when a call gets no reply in time.
pub const RPC_TIMEOUT_MESSAGE: &str = "RPC timeout exceeded";

/// Prefetch applied by RPC servers: one call in flight per server.
pub const RPC_PREFETCH: u16 = 1;
