//! # Integration Scenarios
//!
//! Each module drives one or more `MessageBus` instances against a shared
//! `MemoryBroker` and checks what the broker saw.

pub mod connection;
pub mod messaging;
pub mod rpc;
