//! Deferred span buffer throughput.
//!
//! Measures the producer path (enqueue into a buffer that fills up and starts
//! dropping) and the consumer path (concurrent drains partitioning a full
//! buffer).
//!
//! Run with: cargo bench -p agent_uplink --bench deferred

use agent_uplink::{DeferredSpanBuffer, DelayedSpanEntry, PendingContext, Span, SpanKind};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

const CAPACITY: usize = 500;
const OFFERED: u64 = 2_000;

fn entries(count: u64) -> Vec<DelayedSpanEntry> {
    (0..count)
        .map(|id| {
            DelayedSpanEntry::new(
                Span::new(1, id, 0, "GET /bench".into(), SpanKind::Server),
                PendingContext {
                    response_headers: vec![("content-type".into(), "text/plain".into())],
                    ..PendingContext::default()
                },
            )
        })
        .collect()
}

fn filled() -> DeferredSpanBuffer {
    let buffer = DeferredSpanBuffer::with_capacity(CAPACITY);
    for entry in entries(CAPACITY as u64) {
        buffer.enqueue(entry);
    }
    buffer
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(OFFERED));

    // Three quarters of the offered entries hit a full buffer and are dropped.
    group.bench_function("fill_then_drop", |b| {
        b.iter_batched(
            || (DeferredSpanBuffer::with_capacity(CAPACITY), entries(OFFERED)),
            |(buffer, batch)| {
                for entry in batch {
                    black_box(buffer.enqueue(entry));
                }
                buffer
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    group.throughput(Throughput::Elements(CAPACITY as u64));

    group.bench_function("single_consumer", |b| {
        b.iter_batched(
            filled,
            |buffer| buffer.drain().map(|e| black_box(e.span_id())).count(),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("four_consumers", |b| {
        b.iter_batched(
            || Arc::new(filled()),
            |buffer| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let buffer = Arc::clone(&buffer);
                        thread::spawn(move || buffer.drain().count())
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_default())
                    .sum::<usize>()
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_drain);
criterion_main!(benches);
