//! # Courier Demo
//!
//! The three example programs, as library functions so they can be tested:
//!
//! - [`scenarios::run_rpc`]: a hypotenuse service, a call it rejects and a call
//!   to a service nobody serves
//! - [`scenarios::run_task`]: a task sent while no listener is attached,
//!   picked up by the next listener
//! - [`scenarios::run_event`]: two subscribers receiving the same events

pub mod scenarios;
pub mod setup;

pub use scenarios::{run_event, run_rpc, run_task, Delta, EventReport, RpcReport};
pub use setup::build_bus;
