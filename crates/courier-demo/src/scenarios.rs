//! Demo scenarios.

use anyhow::{Context, Result};
use courier_bus::{BusError, MessageBus};
use courier_telemetry::{metric_inc, BusMetrics, ReplyCounts};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Name of the hypotenuse RPC service.
pub const RPC_SERVICE: &str = "jeweet-rpc";

/// A service nobody answers.
pub const MISSING_SERVICE: &str = "jeweet-rpc-unexisting";

pub const TASK_QUEUE: &str = "jeweet-persist";

pub const EVENT_NAME: &str = "jeweet";

/// Input of the hypotenuse service. Both fields are required by the handler,
/// not by the decoder, so incomplete requests reach it and get a remote error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub dx: Option<f64>,
    pub dy: Option<f64>,
}

/// Hypotenuse of `dx` and `dy`.
pub async fn hypotenuse(delta: Delta) -> Result<f64, String> {
    match (delta.dx, delta.dy) {
        (Some(dx), Some(dy)) => Ok((dx.powi(2) + dy.powi(2)).sqrt()),
        _ => Err("{dx, dy} missing".to_string()),
    }
}

fn outcome<T>(result: &Result<T, BusError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(BusError::Remote(_)) => "remote_error",
        Err(BusError::Timeout(_)) => "timeout",
        Err(_) => "error",
    }
}

fn record_replies(bus: &MessageBus, metrics: &BusMetrics) {
    let stats = bus.reply_stats();
    metrics.record_replies(ReplyCounts {
        registered: stats.registered,
        dispatched: stats.dispatched,
        orphaned: stats.orphaned,
        cancelled: stats.cancelled,
    });
}

/// Outcome of the three RPC calls.
#[derive(Debug)]
pub struct RpcReport {
    pub missing_service: Result<Value, BusError>,
    pub incomplete: Result<f64, BusError>,
    pub hypotenuse: Result<f64, BusError>,
}

/// Serve the hypotenuse, then call a missing service, the service with bad
/// input and the service with `{dx: 3, dy: 4}`.
pub async fn run_rpc(
    bus: &MessageBus,
    metrics: &BusMetrics,
    missing_timeout: Duration,
) -> Result<RpcReport> {
    let server = bus
        .reply(RPC_SERVICE, |delta: Delta| {
            info!(?delta, "Hypotenuse requested");
            hypotenuse(delta)
        })
        .await
        .context("failed to start the hypotenuse service")?;

    let missing_service = {
        let _timer = metrics.time_rpc();
        bus.call_with_timeout(MISSING_SERVICE, &(), missing_timeout)
            .await
    };
    metrics.rpc_call(outcome(&missing_service));

    let incomplete = {
        let _timer = metrics.time_rpc();
        bus.call(RPC_SERVICE, &json!({"test": "data"})).await
    };
    metrics.rpc_call(outcome(&incomplete));

    let hypotenuse = {
        let _timer = metrics.time_rpc();
        bus.call(RPC_SERVICE, &Delta {
            dx: Some(3.0),
            dy: Some(4.0),
        })
        .await
    };
    metrics.rpc_call(outcome(&hypotenuse));

    server.cancel().await.context("failed to stop the hypotenuse service")?;
    record_replies(bus, metrics);

    Ok(RpcReport {
        missing_service,
        incomplete,
        hypotenuse,
    })
}

/// Attach a task listener, detach it, send a task, then let a fresh listener
/// pick the waiting task up. Returns the task as received.
pub async fn run_task(bus: &MessageBus, metrics: &BusMetrics, wait: Duration) -> Result<Value> {
    let early = bus
        .listen_task(TASK_QUEUE, |_: Value| async {})
        .await
        .context("failed to attach the first task listener")?;
    early.cancel().await.context("failed to detach the first task listener")?;

    let task = json!({
        "hello": "world",
        "M_ID": 572,
        "alpha": ["A", "B", "C"],
    });
    bus.send_task(TASK_QUEUE, &task)
        .await
        .context("failed to send the task")?;
    metrics.message_sent("task");
    info!(queue = TASK_QUEUE, "Task sent with no listener attached");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let late = bus
        .listen_task(TASK_QUEUE, move |task: Value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(task);
            }
        })
        .await
        .context("failed to attach the second task listener")?;

    let received = tokio::time::timeout(wait, rx.recv())
        .await
        .context("timed out waiting for the task")?
        .context("task listener stopped")?;
    metrics.message_received("task");

    late.cancel().await.context("failed to detach the second task listener")?;
    Ok(received)
}

/// Events as seen by each subscriber, in arrival order.
#[derive(Debug, Default, PartialEq)]
pub struct EventReport {
    pub first: Vec<Value>,
    pub second: Vec<Value>,
}

/// Publish two events to two subscribers.
pub async fn run_event(bus: &MessageBus, metrics: &BusMetrics, wait: Duration) -> Result<EventReport> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscriptions = Vec::new();
    for subscriber in 0..2usize {
        let tx = tx.clone();
        let subscription = bus
            .subscribe(EVENT_NAME, move |event: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((subscriber, event));
                }
            })
            .await
            .context("failed to subscribe")?;
        subscriptions.push(subscription);
    }
    drop(tx);

    let events = [
        json!("first message!"),
        json!({"hello": "world", "M_ID": 572, "alpha": ["A", "B", "C"]}),
    ];
    for event in &events {
        bus.publish(EVENT_NAME, event)
            .await
            .context("failed to publish")?;
        metrics.message_sent("event");
    }

    let mut report = EventReport::default();
    for _ in 0..events.len() * subscriptions.len() {
        let (subscriber, event) = tokio::time::timeout(wait, rx.recv())
            .await
            .context("timed out waiting for events")?
            .context("subscribers stopped")?;
        metric_inc!(metrics.messages_received, "event");
        match subscriber {
            0 => report.first.push(event),
            _ => report.second.push(event),
        }
    }

    for subscription in subscriptions {
        subscription.cancel().await.context("failed to unsubscribe")?;
    }
    Ok(report)
}
