//! Routing Hot Path Benchmarks
//!
//! Measures delay computation for the redelivery policies and the cost of
//! driving exchanges through routes with error handling and duplicate
//! detection enabled.

use courier_core::{Exchange, ExchangePattern, RouteContext, expression};
use courier_routing::{
    ErrorHandlerBuilder, IdempotentOptions, MemoryIdempotentRepository, RedeliveryPolicy,
    RouteBuilder,
};
use courier_testing::FlakyProcessor;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

/// Benchmark delay computation for each back-off flavour
fn bench_delay_computation(c: &mut Criterion) {
    let mut group = c.benchmark_group("redelivery_delay");
    group.throughput(Throughput::Elements(1));

    let fixed = RedeliveryPolicy::builder()
        .redelivery_delay(Duration::from_millis(100))
        .build()
        .unwrap();
    let exponential = RedeliveryPolicy::builder()
        .redelivery_delay(Duration::from_millis(100))
        .use_exponential_back_off(true)
        .back_off_multiplier(2.0)
        .maximum_redelivery_delay(Duration::from_secs(60))
        .build()
        .unwrap();
    let jittered = RedeliveryPolicy::builder()
        .redelivery_delay(Duration::from_millis(100))
        .use_exponential_back_off(true)
        .use_collision_avoidance(true)
        .build()
        .unwrap();
    let patterned = RedeliveryPolicy::builder()
        .delay_pattern("0:100;5:1000;10:5000")
        .build()
        .unwrap();

    for (name, policy) in [
        ("fixed", &fixed),
        ("exponential", &exponential),
        ("collision_avoidance", &jittered),
        ("delay_pattern", &patterned),
    ] {
        group.bench_with_input(BenchmarkId::new("delay_for", name), policy, |b, policy| {
            b.iter(|| {
                for attempt in 1..=12 {
                    black_box(policy.redelivery_delay_for(black_box(attempt)));
                }
            })
        });
    }

    group.finish();
}

/// Benchmark exchanges flowing through a route
fn bench_route_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("route_throughput");
    group.throughput(Throughput::Elements(1));

    let context = RouteContext::new("bench");
    let plain = RouteBuilder::new(&context, "plain")
        .process_fn("noop", |_: &mut Exchange| Ok(()))
        .build()
        .unwrap();

    let policy = RedeliveryPolicy::builder()
        .maximum_redeliveries(3)
        .redelivery_delay(Duration::ZERO)
        .build()
        .unwrap();
    let guarded = RouteBuilder::new(&context, "guarded")
        .error_handler(ErrorHandlerBuilder::default_error_handler().redelivery_policy(policy))
        .process_fn("noop", |_: &mut Exchange| Ok(()))
        .build()
        .unwrap();

    group.bench_function("plain", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(plain.send_body("payload").await.unwrap());
        })
    });

    group.bench_function("with_error_handler", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(guarded.send_body("payload").await.unwrap());
        })
    });

    for failures in [1usize, 3] {
        group.bench_with_input(
            BenchmarkId::new("redelivered", failures),
            &failures,
            |b, &failures| {
                b.to_async(&rt).iter(|| async move {
                    let context = RouteContext::new("bench");
                    let policy = RedeliveryPolicy::builder()
                        .maximum_redeliveries(failures as i32)
                        .redelivery_delay(Duration::ZERO)
                        .build()
                        .unwrap();
                    let route = RouteBuilder::new(&context, "redelivered")
                        .error_handler(
                            ErrorHandlerBuilder::default_error_handler().redelivery_policy(policy),
                        )
                        .process(Arc::new(FlakyProcessor::failing_times(failures, "transient")))
                        .build()
                        .unwrap();
                    black_box(route.send_body("payload").await.unwrap());
                })
            },
        );
    }

    group.finish();
}

/// Benchmark duplicate detection against a warm repository
fn bench_idempotent_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("idempotent_consumer");

    let context = RouteContext::new("bench");
    let route = RouteBuilder::new(&context, "dedup")
        .idempotent(
            expression::header("id"),
            Arc::new(MemoryIdempotentRepository::new(10_000)),
            IdempotentOptions::default(),
        )
        .process_fn("noop", |_: &mut Exchange| Ok(()))
        .build()
        .unwrap();

    rt.block_on(async {
        for i in 0..1_000 {
            let exchange = context
                .create_exchange(ExchangePattern::InOnly)
                .with_header("id", format!("id-{}", i));
            route.send(exchange).await.unwrap();
        }
    });

    group.bench_function("duplicate", |b| {
        b.to_async(&rt).iter(|| async {
            let exchange = context
                .create_exchange(ExchangePattern::InOnly)
                .with_header("id", "id-500");
            black_box(route.send(exchange).await.unwrap());
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_delay_computation,
    bench_route_throughput,
    bench_idempotent_lookup
);
criterion_main!(benches);
