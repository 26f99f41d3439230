/// Message path benchmarks using Criterion
///
/// Run with: cargo bench --bench message_path_benchmark
///
/// Benchmarks cover:
/// - Boundary validation of raw JSON
/// - Validate + route through the router
/// - Request/response round trips over the in-process hub
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use weave_core::router::Dispatch;
use weave_core::{
    handler_fn, LocalHub, MeshError, Message, MessageBus, MessageRouter, MessageValidator,
    RouteKind, TransportConfig,
};

fn raw_request(payload_len: usize) -> Value {
    Message::request("bench-a", "bench-b", json!({ "op": "echo", "data": "x".repeat(payload_len) }))
        .to_json()
        .unwrap()
}

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");
    let validator = MessageValidator::default();

    for size in [16usize, 1_024, 64 * 1_024] {
        let raw = raw_request(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &raw, |b, raw| {
            b.iter(|| black_box(validator.validate(black_box(raw)).is_ok()));
        });
    }
    group.finish();
}

fn bench_route(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let router = MessageRouter::new(Arc::new(MessageValidator::default()));
    router.register(
        RouteKind::Request,
        Arc::new(|msg: Message| -> Dispatch {
            black_box(msg);
            None
        }),
    );
    let raw = raw_request(64);

    let mut group = c.benchmark_group("route");
    group.throughput(Throughput::Elements(1));
    group.bench_function("validate_and_route", |b| {
        b.iter(|| black_box(router.route_raw(black_box(&raw))));
    });
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let (_hub, a, _b) = rt.block_on(async {
        let hub = LocalHub::new(TransportConfig::default());
        let a = MessageBus::builder("bench-a", Arc::new(hub.attach("bench-a").unwrap()))
            .build()
            .unwrap();
        let b = MessageBus::builder("bench-b", Arc::new(hub.attach("bench-b").unwrap()))
            .build()
            .unwrap();
        b.register_handler(
            "echo",
            handler_fn(|_ctx, payload| async move { Ok::<_, MeshError>(payload) }),
        );
        (hub, a, b)
    });

    let mut group = c.benchmark_group("round_trip");
    group.throughput(Throughput::Elements(1));
    group.bench_function("request_response", |bch| {
        bch.to_async(&rt).iter(|| async {
            let resp = a
                .request("bench-b", json!({ "op": "echo", "n": 1 }), Duration::from_secs(5))
                .await
                .unwrap();
            black_box(resp);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_validate, bench_route, bench_round_trip);
criterion_main!(benches);
