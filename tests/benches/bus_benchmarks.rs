//! # Courier Bus Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | codec | payload encode / decode, reply envelope parsing |
//! | naming | resource names per pattern |
//! | rpc | call round trip over the in-memory broker |
//! | events | publish to N subscribers |

use courier_bus::codec;
use courier_bus::{BusConfig, MemoryBroker, MessageBus, Pattern, ReplyEnvelope};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn payload(items: usize) -> Value {
    json!({
        "hello": "world",
        "M_ID": 572,
        "alpha": (0..items).map(|i| format!("item-{i}")).collect::<Vec<_>>(),
    })
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Codec
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for items in [1, 100, 1000] {
        let value = payload(items);
        let bytes = codec::encode_payload(&value).unwrap();

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", items), &value, |b, value| {
            b.iter(|| black_box(codec::encode_payload(value).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", items), &bytes, |b, bytes| {
            b.iter(|| black_box(codec::decode::<Value>(bytes).unwrap()))
        });
    }

    let reply = json!([null, payload(10)]);
    group.bench_function("reply_envelope", |b| {
        b.iter(|| black_box(ReplyEnvelope::from_value(reply.clone()).unwrap().into_result()))
    });

    group.finish();
}

fn bench_naming(c: &mut Criterion) {
    c.bench_function("naming/resource", |b| {
        b.iter(|| {
            for pattern in [Pattern::Direct, Pattern::Task, Pattern::Event, Pattern::Rpc] {
                black_box(pattern.resource(black_box("jeweet")));
            }
        })
    });
}

// ============================================================================
// Round trips
// ============================================================================

fn bench_rpc_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let broker = MemoryBroker::new();
    let config = BusConfig::default().timeout(Duration::from_secs(5));
    let server = MessageBus::new(config.clone(), Arc::new(broker.clone()));
    let client = MessageBus::new(config, Arc::new(broker));

    rt.block_on(async {
        server
            .reply("echo", |v: Value| async move { Ok::<_, Value>(v) })
            .await
            .unwrap();
        client.connect().await.unwrap();
    });

    let mut group = c.benchmark_group("rpc");
    let request = payload(10);
    group.bench_function("call_echo", |b| {
        b.iter(|| {
            rt.block_on(async {
                let answer: Value = client.call("echo", &request).await.unwrap();
                black_box(answer)
            })
        })
    });
    group.finish();

    rt.block_on(async {
        client.close().await.unwrap();
        server.close().await.unwrap();
    });
}

fn bench_event_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("events");

    for subscribers in [1usize, 4, 16] {
        let bus = MessageBus::new(BusConfig::default(), Arc::new(MemoryBroker::new()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        rt.block_on(async {
            for _ in 0..subscribers {
                let tx = tx.clone();
                bus.subscribe("tick", move |_: Value| {
                    let _ = tx.send(());
                    async {}
                })
                .await
                .unwrap();
            }
        });

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_function(BenchmarkId::new("publish", subscribers), |b| {
            b.iter(|| {
                rt.block_on(async {
                    bus.publish("tick", &json!(1)).await.unwrap();
                    for _ in 0..subscribers {
                        rx.recv().await.unwrap();
                    }
                })
            })
        });

        rt.block_on(async { bus.close().await.unwrap() });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_naming,
    bench_rpc_round_trip,
    bench_event_fanout,
);

criterion_main!(benches);
