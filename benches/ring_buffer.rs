//! Criterion benchmarks for ring buffer hot paths.
//!
//! Key metrics:
//! - Push latency for the channel widths in use (1 to 24 columns)
//! - Snapshot latency for a full 31-day minute channel
//! - Store contention between pollers writing and a reader taking snapshots
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lab_monitor::telemetry::{ChannelSpec, Resolution, RingBuffer, TelemetryStore};
use std::sync::Arc;
use std::thread;

/// 31 days of one-minute rows.
const MONTH_OF_MINUTES: usize = 31 * 1440;

/// Push throughput for the column counts of the catalog: FIRE (1), MAG (4),
/// and a 12-channel HV board (24).
fn ring_buffer_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_push");

    for columns in [1usize, 4, 24] {
        let mut rb = RingBuffer::new(MONTH_OF_MINUTES, columns).unwrap();
        let row = vec![1.5f64; columns];
        let mut t = 0.0;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("push", columns), &columns, |b, _| {
            b.iter(|| {
                t += 60.0;
                rb.push(black_box(t), black_box(&row)).unwrap();
            });
        });
    }

    group.finish();
}

/// Snapshot latency at different fill levels of a month-long channel.
fn ring_buffer_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_snapshot");

    for (name, rows) in [
        ("empty", 0usize),
        ("1day", 1440),
        ("full", MONTH_OF_MINUTES),
        ("wrapped", MONTH_OF_MINUTES + 720),
    ] {
        let mut rb = RingBuffer::new(MONTH_OF_MINUTES, 4).unwrap();
        for i in 0..rows {
            rb.push(i as f64 * 60.0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("snapshot", name), &rows, |b, _| {
            b.iter(|| {
                let snapshot = rb.snapshot();
                black_box(snapshot);
            });
        });
    }

    group.finish();
}

/// Several pollers updating their own channel while one reader snapshots.
fn store_concurrent_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_concurrent");

    for writers in [1usize, 2, 4, 8] {
        let specs: Vec<ChannelSpec> = (0..writers)
            .map(|i| ChannelSpec::new(format!("CH{i}"), &["a", "b", "c"], Resolution::Fast))
            .collect();
        let store = Arc::new(TelemetryStore::new(&specs, 1).unwrap());

        group.bench_with_input(
            BenchmarkId::new("updates_with_reader", writers),
            &writers,
            |b, &writers| {
                b.iter(|| {
                    let mut handles = vec![];

                    for i in 0..writers {
                        let store = Arc::clone(&store);
                        handles.push(thread::spawn(move || {
                            let key = format!("CH{i}");
                            for n in 0..100 {
                                store
                                    .update_channel(&key, f64::from(n), &[1.0, 2.0, 3.0])
                                    .unwrap();
                            }
                        }));
                    }

                    let reader = Arc::clone(&store);
                    handles.push(thread::spawn(move || {
                        for _ in 0..10 {
                            black_box(reader.snapshot("CH0").unwrap());
                        }
                    }));

                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Gap marking, which runs on every missed poll.
fn ring_buffer_gap(c: &mut Criterion) {
    let mut rb = RingBuffer::new(1440, 4).unwrap();

    c.bench_function("ring_buffer_skip", |b| {
        b.iter(|| {
            rb.skip();
        });
    });
}

criterion_group!(
    benches,
    ring_buffer_push,
    ring_buffer_snapshot,
    store_concurrent_updates,
    ring_buffer_gap
);
criterion_main!(benches);
