//! Shared test fixtures.

use courier_bus::{BusConfig, MemoryBroker, MessageBus};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a test waits for something that should happen promptly.
pub const PROMPT: Duration = Duration::from_secs(2);

/// A bus with its own connection to `broker`.
pub fn bus_on(broker: &MemoryBroker, timeout: Duration) -> MessageBus {
    MessageBus::new(
        BusConfig::with_url("amqp://localhost:5672").timeout(timeout),
        Arc::new(broker.clone()),
    )
}

/// Handler that forwards every payload into a channel, plus the receiving end.
pub fn collector<T>() -> (
    impl Fn(T) -> std::future::Ready<()> + Send + Sync + Clone + 'static,
    mpsc::UnboundedReceiver<T>,
)
where
    T: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |payload: T| {
        let _ = tx.send(payload);
        std::future::ready(())
    };
    (handler, rx)
}

/// Receive the next item or panic after [`PROMPT`].
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    match tokio::time::timeout(PROMPT, rx.recv()).await {
        Ok(Some(item)) => item,
        Ok(None) => panic!("channel closed"),
        Err(_) => panic!("nothing received within {PROMPT:?}"),
    }
}

/// Poll `condition` until it holds or [`PROMPT`] elapses.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + PROMPT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {PROMPT:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` to completion with a [`PROMPT`] deadline.
pub async fn within<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(PROMPT, future).await {
        Ok(output) => output,
        Err(_) => panic!("future did not complete within {PROMPT:?}"),
    }
}
