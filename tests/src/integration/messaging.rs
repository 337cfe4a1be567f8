//! # One-Way Messaging
//!
//! Direct queues, durable task queues and fan-out events across several buses
//! sharing one broker.

#[cfg(test)]
mod tests {
    use crate::fixtures::{bus_on, collector, eventually, recv, within};
    use courier_bus::{MemoryBroker, MessageBus};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    const TIMEOUT: Duration = Duration::from_millis(500);

    type Seen = (usize, u64);

    fn tagged(
        bus: usize,
        tx: &mpsc::UnboundedSender<Seen>,
    ) -> impl Fn(Value) -> std::future::Ready<()> + Send + Sync + 'static {
        let tx = tx.clone();
        move |payload: Value| {
            if let Some(n) = payload["n"].as_u64() {
                let _ = tx.send((bus, n));
            }
            std::future::ready(())
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Seen>, count: usize) -> Vec<Seen> {
        let mut seen = Vec::with_capacity(count);
        for _ in 0..count {
            seen.push(recv(rx).await);
        }
        seen
    }

    // =========================================================================
    // DIRECT
    // =========================================================================

    #[tokio::test]
    async fn test_direct_listeners_share_messages_exactly_once() {
        let broker = MemoryBroker::new();
        let sender = bus_on(&broker, TIMEOUT);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listeners: Vec<MessageBus> = (0..2).map(|_| bus_on(&broker, TIMEOUT)).collect();
        for (i, bus) in listeners.iter().enumerate() {
            bus.listen("work", tagged(i, &tx)).await.unwrap();
        }

        for n in 0..10u64 {
            sender.send("work", &json!({ "n": n })).await.unwrap();
        }
        let seen = drain(&mut rx, 10).await;

        let numbers: BTreeSet<u64> = seen.iter().map(|(_, n)| *n).collect();
        assert_eq!(numbers, (0..10).collect());
        assert!(seen.iter().any(|(bus, _)| *bus == 0));
        assert!(seen.iter().any(|(bus, _)| *bus == 1));
        eventually(|| broker.acks("dwork") == 10).await;
    }

    #[tokio::test]
    async fn test_direct_handler_sees_messages_in_order() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let (handler, mut rx) = collector::<u32>();
        bus.listen("ordered", handler).await.unwrap();

        for n in 0..20u32 {
            bus.send("ordered", &n).await.unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..20 {
            received.push(recv(&mut rx).await);
        }
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_typed_payloads() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Order {
            id: u32,
            items: Vec<String>,
        }

        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let (handler, mut rx) = collector::<Order>();
        bus.listen("orders", handler).await.unwrap();

        let order = Order {
            id: 7,
            items: vec!["tea".to_string()],
        };
        bus.send("orders", &order).await.unwrap();

        assert_eq!(recv(&mut rx).await, order);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let (handler, mut rx) = collector::<u32>();
        bus.listen("numbers", handler).await.unwrap();

        bus.send("numbers", &json!("not a number")).await.unwrap();
        bus.send("numbers", &5u32).await.unwrap();

        assert_eq!(recv(&mut rx).await, 5);
        eventually(|| broker.acks("dnumbers") == 2).await;
    }

    // =========================================================================
    // TASKS
    // =========================================================================

    #[tokio::test]
    async fn test_task_listeners_share_tasks_exactly_once() {
        let broker = MemoryBroker::new();
        let sender = bus_on(&broker, TIMEOUT);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let workers: Vec<MessageBus> = (0..2).map(|_| bus_on(&broker, TIMEOUT)).collect();
        for (i, bus) in workers.iter().enumerate() {
            bus.listen_task("jobs", tagged(i, &tx)).await.unwrap();
        }

        for n in 0..8u64 {
            sender.send_task("jobs", &json!({ "n": n })).await.unwrap();
        }
        let seen = drain(&mut rx, 8).await;

        let numbers: BTreeSet<u64> = seen.iter().map(|(_, n)| *n).collect();
        assert_eq!(numbers.len(), 8);
        assert!(broker
            .published_to_queue("pjobs")
            .iter()
            .all(|m| m.properties.persistent));
        eventually(|| broker.acks("pjobs") == 8).await;
    }

    #[tokio::test]
    async fn test_task_waits_for_a_listener() {
        let broker = MemoryBroker::new();
        let sender = bus_on(&broker, TIMEOUT);
        let worker = bus_on(&broker, TIMEOUT);

        sender.send_task("backlog", &json!({"M_ID": 572})).await.unwrap();
        assert_eq!(broker.ready_count("pbacklog"), 1);

        let (handler, mut rx) = collector::<Value>();
        worker.listen_task("backlog", handler).await.unwrap();

        assert_eq!(recv(&mut rx).await, json!({"M_ID": 572}));
        sender.close().await.unwrap();
        worker.close().await.unwrap();
        assert!(broker.queue_exists("pbacklog"));
    }

    #[tokio::test]
    async fn test_slow_task_holds_back_the_next_one() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        bus.listen_task("slow", {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            move |_: Value| {
                let release = Arc::clone(&release);
                started.fetch_add(1, Ordering::SeqCst);
                async move { release.notified().await }
            }
        })
        .await
        .unwrap();

        bus.send_task("slow", &json!(1)).await.unwrap();
        bus.send_task("slow", &json!(2)).await.unwrap();

        eventually(|| started.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        release.notify_one();
        eventually(|| started.load(Ordering::SeqCst) == 2).await;
        release.notify_one();
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    #[tokio::test]
    async fn test_event_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let publisher = bus_on(&broker, TIMEOUT);
        let first = bus_on(&broker, TIMEOUT);
        let second = bus_on(&broker, TIMEOUT);

        let (h1, mut rx1) = collector::<Value>();
        let (h2, mut rx2) = collector::<Value>();
        first.subscribe("jeweet", h1).await.unwrap();
        second.on("jeweet", h2).await.unwrap();

        publisher.publish("jeweet", &json!("first message!")).await.unwrap();
        publisher.emit("jeweet", &json!({"hello": "world"})).await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(recv(rx).await, json!("first message!"));
            assert_eq!(recv(rx).await, json!({"hello": "world"}));
        }
    }

    #[tokio::test]
    async fn test_event_without_subscribers_is_dropped() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);

        bus.publish("lonely", &json!(1)).await.unwrap();

        let (handler, mut rx) = collector::<Value>();
        bus.subscribe("lonely", handler).await.unwrap();
        bus.publish("lonely", &json!(2)).await.unwrap();

        assert_eq!(recv(&mut rx).await, json!(2));
    }

    #[tokio::test]
    async fn test_subscriber_queue_dies_with_its_connection() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let subscription = bus.subscribe("news", |_: Value| async {}).await.unwrap();
        let queue = subscription.queue().to_string();
        assert!(broker.queue_exists(&queue));

        within(bus.close()).await.unwrap();

        assert!(!broker.queue_exists(&queue));
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_receiving() {
        let broker = MemoryBroker::new();
        let bus = bus_on(&broker, TIMEOUT);
        let (h1, mut kept) = collector::<Value>();
        let (h2, mut dropped) = collector::<Value>();
        bus.subscribe("feed", h1).await.unwrap();
        let gone = bus.subscribe("feed", h2).await.unwrap();

        gone.cancel().await.unwrap();
        bus.publish("feed", &json!("after")).await.unwrap();

        assert_eq!(recv(&mut kept).await, json!("after"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dropped.try_recv().is_err());
    }
}
