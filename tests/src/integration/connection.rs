//! # Connection Lifecycle
//!
//! Single-flight connect under concurrent first use, shared failures, close
//! racing with connect, and lazy reconnection after close.

#[cfg(test)]
mod tests {
    use crate::fixtures::{bus_on, collector, recv, within};
    use courier_bus::{BusError, ConnectionStatus, MemoryBroker};
    use futures::future::join_all;
    use serde_json::{json, Value};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(500);

    // =========================================================================
    // SINGLE-FLIGHT CONNECT
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_first_use_opens_one_connection() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(20)));
        let bus = bus_on(&broker, TIMEOUT);

        let sends = (0..10).map(|i| {
            let bus = bus.clone();
            async move { bus.send("fanin", &json!({ "n": i })).await }
        });
        let results = within(join_all(sends)).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.channels_opened(), 1);
        assert_eq!(bus.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_mixed_patterns_share_the_connection() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(10)));
        let bus = bus_on(&broker, TIMEOUT);

        let task_payload = json!(1);
        let news_payload = json!(2);
        let (a, b, c) = tokio::join!(
            bus.send_task("jobs", &task_payload),
            bus.publish("news", &news_payload),
            bus.listen("inbox", |_: Value| async {}),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.channels_opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_reaches_every_waiter_then_retries() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        broker.set_connect_delay(Some(Duration::from_millis(20)));
        let bus = bus_on(&broker, TIMEOUT);

        let sends = (0..3).map(|_| {
            let bus = bus.clone();
            async move { bus.send("q", &json!("hi")).await }
        });
        let results = within(join_all(sends)).await;

        for result in results {
            assert!(matches!(result, Err(BusError::Connect(_))));
        }
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(bus.status(), ConnectionStatus::Disconnected);

        bus.send("q", &json!("again")).await.unwrap();
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(bus.status(), ConnectionStatus::Connected);
    }

    // =========================================================================
    // CLOSE
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_closes_tear_down_once() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        bus.connect().await.unwrap();

        let closes = (0..5).map(|_| {
            let bus = bus.clone();
            async move { bus.close().await }
        });
        let results = within(join_all(closes)).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(broker.channels_closed(), 1);
        assert_eq!(broker.connections_closed(), 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_without_connection_is_a_no_op() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);

        bus.close().await.unwrap();

        assert_eq!(broker.connect_count(), 0);
        assert_eq!(broker.connections_closed(), 0);
    }

    #[tokio::test]
    async fn test_close_during_connect_waits_then_tears_down() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(30)));
        let bus = bus_on(&broker, TIMEOUT);

        let connecting = tokio::spawn({
            let bus = bus.clone();
            async move { bus.connect().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bus.status(), ConnectionStatus::Connecting);

        within(bus.close()).await.unwrap();
        connecting.await.unwrap().unwrap();

        assert_eq!(bus.status(), ConnectionStatus::Disconnected);
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.connections_closed(), 1);
    }

    // =========================================================================
    // RECONNECT
    // =========================================================================

    #[tokio::test]
    async fn test_operations_reconnect_after_close() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let first = bus.connect().await.unwrap();
        bus.close().await.unwrap();

        let (handler, mut rx) = collector::<Value>();
        bus.listen("after", handler).await.unwrap();
        bus.send("after", &json!({"back": true})).await.unwrap();

        assert_eq!(recv(&mut rx).await, json!({"back": true}));
        let second = bus.connect().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let subscription = bus.listen("closing", |_: Value| async {}).await.unwrap();

        bus.close().await.unwrap();

        crate::fixtures::eventually(|| subscription.is_finished()).await;
    }
}
