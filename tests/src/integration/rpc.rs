//! # Request/Reply
//!
//! Calls against servers on other buses: reply routing by correlation id,
//! client and server timeouts, late replies, and peers speaking the raw
//! `[error, result]` envelope.

#[cfg(test)]
mod tests {
    use crate::fixtures::{bus_on, eventually, recv, within};
    use courier_bus::broker::{BrokerChannel, MessageProperties, QueueOptions};
    use courier_bus::codec;
    use courier_bus::{BusError, ConnectionManager, MemoryBroker};
    use futures::future::join_all;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn raw_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        ConnectionManager::new(Arc::new(broker.clone()), "amqp://localhost:5672")
            .channel()
            .await
            .unwrap()
    }

    /// Consume `queue` on a raw channel and forward every body.
    async fn raw_inbox(broker: &MemoryBroker, queue: &str) -> mpsc::UnboundedReceiver<Value> {
        let channel = raw_channel(broker).await;
        channel.declare_queue(queue, QueueOptions::TRANSIENT).await.unwrap();
        let mut consumer = channel.consume(queue).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.deliveries.next().await {
                let _ = channel.ack(delivery.tag).await;
                if let Ok(body) = codec::decode::<Value>(&delivery.body) {
                    let _ = tx.send(body);
                }
            }
        });
        rx
    }

    /// Serve `rpc{name}` on a raw channel, answering every call with `envelope`.
    async fn raw_responder(broker: &MemoryBroker, name: &str, envelope: Value) {
        let channel = raw_channel(broker).await;
        let queue = format!("r{name}");
        channel.declare_queue(&queue, QueueOptions::TRANSIENT).await.unwrap();
        let mut consumer = channel.consume(&queue).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.deliveries.next().await {
                let _ = channel.ack(delivery.tag).await;
                let Some(reply_to) = delivery.properties.reply_to else {
                    continue;
                };
                let reply = MessageProperties::reply(delivery.properties.correlation_id);
                let body = codec::encode(&envelope).unwrap();
                let _ = channel.publish("", &reply_to, body, reply).await;
            }
        });
    }

    // =========================================================================
    // HAPPY PATH
    // =========================================================================

    #[tokio::test]
    async fn test_echo_is_acked_exactly_once() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("echo", |v: Value| async move { Ok::<_, Value>(v) })
            .await
            .unwrap();

        let answer: Value = client.call("echo", &json!({"a": 1})).await.unwrap();

        assert_eq!(answer, json!({"a": 1}));
        eventually(|| broker.acks("recho") == 1).await;
        assert_eq!(broker.nacks("recho"), 0);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, Duration::from_secs(2));
        server
            .reply("double", |n: i64| async move { Ok::<_, String>(n * 2) })
            .await
            .unwrap();

        let calls = (0..20i64).map(|n| {
            let client = client.clone();
            async move { (n, client.call::<_, i64>("double", &n).await) }
        });
        let results = within(join_all(calls)).await;

        for (n, result) in results {
            assert_eq!(result.unwrap(), n * 2);
        }
        assert_eq!(broker.generated_queues().len(), 1);
        let stats = client.reply_stats();
        assert_eq!(stats.registered, 20);
        assert_eq!(stats.dispatched, 20);
    }

    #[tokio::test]
    async fn test_reply_before_timeout_settles_the_call_once() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("quick", |_: Value| async { Ok::<_, Value>(json!("done")) })
            .await
            .unwrap();

        let answer: Value = client
            .call_with_timeout("quick", &json!(null), Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(answer, json!("done"));
        let stats = client.reply_stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.orphaned, 0);
    }

    #[tokio::test]
    async fn test_falsy_payload_arrives_as_empty_object() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("inspect", |v: Value| async move { Ok::<_, Value>(v) })
            .await
            .unwrap();

        let answer: Value = client.call("inspect", &json!(null)).await.unwrap();

        assert_eq!(answer, json!({}));
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_remote_error_value_is_passed_through() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("picky", |_: Value| async {
                Err::<Value, _>(json!({"code": 42, "reason": "nope"}))
            })
            .await
            .unwrap();

        let err = client.call::<_, Value>("picky", &json!({})).await.unwrap_err();

        assert_eq!(err.remote_value(), Some(&json!({"code": 42, "reason": "nope"})));
        eventually(|| broker.acks("rpicky") == 1).await;
    }

    #[tokio::test]
    async fn test_falsy_remote_error_reads_as_success() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("zero", |_: Value| async { Err::<Value, _>(json!(0)) })
            .await
            .unwrap();

        let answer: Value = client.call("zero", &json!({})).await.unwrap();

        assert_eq!(answer, Value::Null);
    }

    #[tokio::test]
    async fn test_non_finite_payload_is_never_sent() {
        let broker = MemoryBroker::new();
        let client = bus_on(&broker, TIMEOUT);

        let err = client
            .call::<_, Value>("measure", &("temperature", f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Encode(_)));

        let err = client.send_task("readings", &[1.0, f64::INFINITY]).await.unwrap_err();
        assert!(matches!(err, BusError::Encode(_)));

        assert!(broker.published_to_queue("rmeasure").is_empty());
        assert!(broker.published_to_queue("preadings").is_empty());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_result_becomes_a_remote_error() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("ratio", |_: Value| async { Ok::<_, Value>(f64::INFINITY) })
            .await
            .unwrap();

        let err = client.call::<_, f64>("ratio", &json!({})).await.unwrap_err();

        assert!(err.remote_value().and_then(Value::as_str).is_some());
    }

    #[tokio::test]
    async fn test_invalid_request_gets_an_error_reply() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        server
            .reply("strict", |n: u32| async move { Ok::<_, String>(n) })
            .await
            .unwrap();
        let mut inbox = raw_inbox(&broker, "strict-inbox").await;

        broker.inject(
            "rstrict",
            b"{oops".to_vec(),
            MessageProperties::request("cid-1", "strict-inbox"),
        );

        let reply = recv(&mut inbox).await;
        let message = reply[0].as_str().unwrap();
        assert!(message.starts_with("invalid request payload"));
        assert_eq!(reply.as_array().unwrap().len(), 1);
        eventually(|| broker.acks("rstrict") == 1).await;
    }

    #[tokio::test]
    async fn test_call_without_reply_queue_is_served_and_discarded() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, TIMEOUT);
        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .reply("quiet", move |v: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(v);
                    Ok::<_, Value>(json!("unheard"))
                }
            })
            .await
            .unwrap();
        let published_before = broker.published().len();

        broker.inject("rquiet", br#"{"x":1}"#.to_vec(), MessageProperties::default());

        assert_eq!(recv(&mut rx).await, json!({"x": 1}));
        eventually(|| broker.acks("rquiet") == 1).await;
        assert_eq!(broker.published().len(), published_before);
    }

    // =========================================================================
    // TIMEOUTS
    // =========================================================================

    #[tokio::test]
    async fn test_call_without_responder_times_out() {
        let broker = MemoryBroker::new();
        let client = bus_on(&broker, TIMEOUT);
        let budget = Duration::from_millis(40);

        let started = Instant::now();
        let err = client
            .call_with_timeout::<_, Value>("jeweet-rpc-unexisting", &json!({}), budget)
            .await
            .unwrap_err();

        assert!(started.elapsed() >= budget);
        match err {
            BusError::Timeout(timeout) => {
                assert_eq!(timeout.message(), "RPC timeout exceeded");
                assert_eq!(timeout.status_code(), 503);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(client.reply_stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_late_reply_is_orphaned() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, Duration::from_secs(1));
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("sluggish", |_: Value| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok::<_, Value>(json!("too late"))
            })
            .await
            .unwrap();

        let err = client
            .call_with_timeout::<_, Value>("sluggish", &json!({}), Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(client.pending_calls(), 0);
        eventually(|| client.reply_stats().orphaned == 1).await;
        assert_eq!(client.reply_stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_slow_handler_is_nacked_without_reply() {
        let broker = MemoryBroker::new();
        let server = bus_on(&broker, Duration::from_millis(50));
        let client = bus_on(&broker, TIMEOUT);
        server
            .reply("stuck", |_: Value| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Value>(json!("never"))
            })
            .await
            .unwrap();

        let started = Instant::now();
        let err = client
            .call_with_timeout::<_, Value>("stuck", &json!({}), Duration::from_millis(150))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(broker.nacks("rstuck") >= 1);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(broker.acks("rstuck"), 0);
        assert_eq!(client.reply_stats().orphaned, 0);
    }

    // =========================================================================
    // INTEROP
    // =========================================================================

    #[tokio::test]
    async fn test_zero_in_error_slot_means_success() {
        let broker = MemoryBroker::new();
        let client = bus_on(&broker, TIMEOUT);
        raw_responder(&broker, "legacy", json!([0, {"ok": true}])).await;

        let answer: Value = client.call("legacy", &json!({})).await.unwrap();

        assert_eq!(answer, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_missing_result_slot_reads_as_null() {
        let broker = MemoryBroker::new();
        let client = bus_on(&broker, TIMEOUT);
        raw_responder(&broker, "terse", json!([null])).await;

        let answer: Value = client.call("terse", &json!({})).await.unwrap();

        assert_eq!(answer, Value::Null);
    }

    #[tokio::test]
    async fn test_non_array_reply_is_a_decode_error() {
        let broker = MemoryBroker::new();
        let client = bus_on(&broker, TIMEOUT);
        raw_responder(&broker, "odd", json!({"result": 1})).await;

        let err = client.call::<_, Value>("odd", &json!({})).await.unwrap_err();

        assert!(matches!(err, BusError::Decode(_)));
    }
}
