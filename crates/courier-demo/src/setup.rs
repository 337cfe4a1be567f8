//! Bus construction for the demo binary.

use anyhow::Result;
use courier_bus::{BusConfig, MemoryBroker, MessageBus};
use std::sync::Arc;

/// Build the bus: the in-memory broker, or AMQP when `amqp_url` is given.
pub fn build_bus(config: BusConfig, amqp_url: Option<String>) -> Result<MessageBus> {
    match amqp_url {
        None => Ok(MessageBus::new(config, Arc::new(MemoryBroker::new()))),
        Some(url) => amqp_bus(BusConfig::with_url(url).timeout(config.timeout)),
    }
}

#[cfg(feature = "amqp")]
fn amqp_bus(config: BusConfig) -> Result<MessageBus> {
    Ok(MessageBus::amqp(config))
}

#[cfg(not(feature = "amqp"))]
fn amqp_bus(_config: BusConfig) -> Result<MessageBus> {
    anyhow::bail!("--amqp needs a build with the `amqp` feature enabled")
}
