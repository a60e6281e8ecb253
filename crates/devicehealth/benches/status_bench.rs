use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use devicehealth::{Frame, HealthStatus, Thresholds, TrackingKey};
use std::hint::black_box;
use tokio::time::Instant;

fn record_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("health_status");

    group.bench_function("record_success", |b| {
        let mut status = HealthStatus::new("drive-1", Thresholds::default());
        let now = Instant::now();
        let mut latency = 0.0;
        b.iter(|| {
            latency = (latency + 7.0) % 50.0;
            status.record_success(black_box(latency), now);
            black_box(status.level())
        });
    });

    group.bench_function("record_failure", |b| {
        let mut status = HealthStatus::new("drive-1", Thresholds::default());
        b.iter(|| {
            status.record_failure("No PONG within 1.0s");
            black_box(status.level())
        });
    });

    // Anomaly detection cost grows with the transit window
    for window in [18usize, 60, 360] {
        group.bench_with_input(BenchmarkId::new("transit_window", window), &window, |b, &window| {
            let thresholds = Thresholds {
                transit_window: window,
                ..Thresholds::default()
            };
            let mut status = HealthStatus::new("drive-1", thresholds);
            let now = Instant::now();
            for i in 0..window {
                status.record_success((i % 10) as f64, now);
            }
            b.iter(|| {
                status.record_success(black_box(5.0), now);
                black_box(status.transit_anomaly_detected())
            });
        });
    }

    group.bench_function("snapshot", |b| {
        let mut status = HealthStatus::new("drive-1", Thresholds::default())
            .with_requested_metrics(["uptime", "mem", "errors"]);
        status.record_success(12.0, Instant::now());
        b.iter(|| black_box(status.snapshot()));
    });

    group.finish();
}

fn codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let payloads: [(&str, &[u8]); 4] = [
        ("bare_pong", b"PONG"),
        ("timestamped_pong", b"PONG:20240315.142530.123"),
        ("zulu", b"ZULU:20240315:142530.123"),
        ("application", b"SET MODE AUTO"),
    ];
    for (name, payload) in payloads {
        group.bench_with_input(BenchmarkId::new("decode", name), payload, |b, payload| {
            b.iter(|| black_box(Frame::decode(black_box(payload))));
        });
    }

    let ping = Frame::Ping(TrackingKey::Timestamp("20240315.142530.123".to_string()));
    group.bench_function("encode_timestamped_ping", |b| {
        b.iter(|| black_box(ping.encode()));
    });

    group.finish();
}

criterion_group!(benches, record_benchmark, codec_benchmark);
criterion_main!(benches);
