// Resilience hot-path benchmarks
//
// Everything here sits on the per-call or per-event path:
// - Backoff delay computation
// - Circuit breaker admission (closed and open)
// - Dedup check against a populated window
// - Channel key parsing and event frame encoding
// - Log classification of a notification

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use sidecar_core::broker::protocol::{encode_line, EventPush};
use sidecar_core::pipeline::{EventDecoder, LogClassifier};
use sidecar_core::resilience::{BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, Deduplicator};
use sidecar_core::{ChannelKey, SidecarError};
use std::time::Duration;

const TOKEN: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

// ============================================================================
// BACKOFF
// ============================================================================

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    group.measurement_time(Duration::from_secs(2));

    let policy = BackoffPolicy::default();
    group.bench_function("compute_delay_jittered", |b| {
        b.iter(|| black_box(policy.compute_delay(black_box(4), false)))
    });
    group.bench_function("compute_delay_rate_limited", |b| {
        b.iter(|| black_box(policy.compute_delay(black_box(4), true)))
    });

    group.finish();
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    group.measurement_time(Duration::from_secs(2));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let closed = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    group.bench_function("execute_closed_success", |b| {
        b.to_async(&runtime).iter(|| async {
            let result: Result<u32, SidecarError> = closed.execute(|| async { Ok(1) }).await;
            black_box(result)
        })
    });

    let open = CircuitBreaker::new(
        "bench-open",
        CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(3600),
            ..CircuitBreakerConfig::default()
        },
    );
    runtime.block_on(async {
        let _: Result<(), SidecarError> = open
            .execute(|| async { Err(SidecarError::Connection("down".into())) })
            .await;
    });
    group.bench_function("execute_open_rejected", |b| {
        b.to_async(&runtime).iter(|| async {
            let result: Result<u32, SidecarError> = open.execute(|| async { Ok(1) }).await;
            black_box(result)
        })
    });

    group.finish();
}

// ============================================================================
// DEDUP
// ============================================================================

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");
    group.measurement_time(Duration::from_secs(2));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let _guard = runtime.enter();

    for populated in [1_000usize, 100_000].iter() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        for i in 0..*populated {
            dedup.check(&format!("token_burn:{}", i));
        }
        group.bench_with_input(BenchmarkId::new("check_duplicate", populated), populated, |b, _| {
            b.iter(|| black_box(dedup.check(black_box("token_burn:42"))))
        });
    }

    group.finish();
}

// ============================================================================
// WIRE PATH
// ============================================================================

fn bench_wire_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_path");
    group.measurement_time(Duration::from_secs(2));

    let raw = format!("logs:{}", TOKEN);
    group.bench_function("channel_key_parse", |b| {
        b.iter(|| black_box(ChannelKey::parse(black_box(&raw))))
    });

    let push = EventPush {
        channel: raw.clone(),
        data: json!({
            "context": {"slot": 250_000_000u64},
            "value": {
                "signature": "5j7s1QjmRKFuDbCWMRVRNibSV2VAAEcNKP6HWU7GwPdXkBZvhz8n4vQ",
                "err": null,
                "logs": [
                    "Program TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA invoke [1]",
                    "Program log: Instruction: Burn",
                    "Program TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA success",
                ],
            },
        }),
    };
    group.bench_function("encode_event_line", |b| {
        b.iter(|| black_box(encode_line(black_box(&push))))
    });

    let decoder = LogClassifier::new();
    group.bench_function("classify_log_notification", |b| {
        b.iter(|| black_box(decoder.decode(black_box(&push))))
    });

    group.finish();
}

// ============================================================================
// CRITERION SETUP
// ============================================================================

criterion_group!(benches, bench_backoff, bench_circuit_breaker, bench_dedup, bench_wire_path);

criterion_main!(benches);
