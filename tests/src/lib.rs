//! # Courier Test Suite
//!
//! Unified test crate for scenarios that cross component boundaries.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── src/
//! │   ├── fixtures.rs        # Buses over a shared in-memory broker
//! │   └── integration/
//! │       ├── connection.rs  # Single-flight connect, close, reconnect
//! │       ├── messaging.rs   # Direct, task and event delivery
//! │       └── rpc.rs         # Calls, replies, timeouts, interop
//! └── benches/
//!     └── bus_benchmarks.rs  # Codec and RPC round-trip throughput
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p courier-tests
//!
//! # By area
//! cargo test -p courier-tests integration::rpc::
//!
//! # Benchmarks
//! cargo bench -p courier-tests
//! ```

#![allow(dead_code)]

pub mod fixtures;
pub mod integration;
