// Backoff and quality-score benchmarks
//
// Both are called on hot observer paths (every failure event, every
// diagnostics poll), so they should stay trivially cheap.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use interview_call::recovery::RetryPolicy;
use interview_call::{CallConfig, ConnectionPath, ConnectionQuality};

fn bench_backoff_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay");

    let jittered = RetryPolicy::from_config(&CallConfig::default());
    let deterministic = RetryPolicy::from_config(&CallConfig::default()).without_jitter();

    for retry in [0u32, 3, 10, 200] {
        group.bench_with_input(BenchmarkId::new("jittered", retry), &retry, |b, &retry| {
            b.iter(|| black_box(jittered.backoff_delay(black_box(retry))));
        });
        group.bench_with_input(
            BenchmarkId::new("deterministic", retry),
            &retry,
            |b, &retry| {
                b.iter(|| black_box(deterministic.backoff_delay(black_box(retry))));
            },
        );
    }

    group.finish();
}

fn bench_quality_score(c: &mut Criterion) {
    let samples = [
        ConnectionQuality {
            path: ConnectionPath::Direct,
            round_trip_ms: Some(18.0),
            packets_lost: 0,
            packets_received: 12_000,
        },
        ConnectionQuality {
            path: ConnectionPath::Reflexive,
            round_trip_ms: Some(140.0),
            packets_lost: 36,
            packets_received: 9_000,
        },
        ConnectionQuality {
            path: ConnectionPath::Relayed,
            round_trip_ms: Some(420.0),
            packets_lost: 800,
            packets_received: 7_500,
        },
    ];

    c.bench_function("quality_score", |b| {
        b.iter(|| {
            for quality in &samples {
                black_box(quality.quality_score());
            }
        });
    });
}

criterion_group!(benches, bench_backoff_delay, bench_quality_score);
criterion_main!(benches);
