//! Batching recorder.
//!
//! Collects finished spans grouped by trace and hands them out as a
//! [`SpanBatch`] once the batch is large or old enough. Sending the batch is
//! the caller's job (see [`HostAgent::flush`](crate::agent::HostAgent::flush)).

use crate::deferred::Recorder;
use crate::span::{Span, SpanBatch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Spans held before new ones are dropped.
    pub max_buffered: usize,
    /// Pending spans that make a batch due.
    pub batch_size_limit: usize,
    /// Age that makes a non-empty batch due.
    pub batch_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_buffered: 10_000,
            batch_size_limit: 1_000,
            batch_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecorderMetrics {
    pub recorded: AtomicU64,
    pub dropped: AtomicU64,
    pub batches_taken: AtomicU64,
}

impl RecorderMetrics {
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn batches_taken(&self) -> u64 {
        self.batches_taken.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Pending {
    by_trace: HashMap<u128, Vec<Span>>,
    total: usize,
    last_take: Instant,
}

/// [`Recorder`] that accumulates spans for batched delivery.
#[derive(Debug)]
pub struct BatchRecorder {
    pending: Mutex<Pending>,
    config: RecorderConfig,
    metrics: RecorderMetrics,
}

impl Default for BatchRecorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

impl BatchRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            pending: Mutex::new(Pending {
                by_trace: HashMap::new(),
                total: 0,
                last_take: Instant::now(),
            }),
            config,
            metrics: RecorderMetrics::default(),
        }
    }

    pub fn total_pending(&self) -> usize {
        self.pending.lock().total
    }

    pub fn metrics(&self) -> &RecorderMetrics {
        &self.metrics
    }

    /// True when the pending spans fill a batch or have waited out the timeout.
    pub fn should_flush(&self) -> bool {
        let pending = self.pending.lock();
        pending.total > 0
            && (pending.total >= self.config.batch_size_limit
                || pending.last_take.elapsed() >= self.config.batch_timeout)
    }

    /// Takes everything pending, or `None` if nothing is.
    pub fn take_batch(&self) -> Option<SpanBatch> {
        let mut pending = self.pending.lock();
        if pending.total == 0 {
            return None;
        }
        let spans: Vec<Span> = pending.by_trace.drain().flat_map(|(_, spans)| spans).collect();
        pending.total = 0;
        pending.last_take = Instant::now();
        drop(pending);

        self.metrics.batches_taken.fetch_add(1, Ordering::Relaxed);
        Some(SpanBatch::with_spans(spans))
    }

    /// Puts a batch back after a failed send, keeping as much as fits.
    pub fn restore(&self, batch: SpanBatch) {
        for span in batch.spans {
            self.push(span);
        }
    }

    fn push(&self, span: Span) -> bool {
        let mut pending = self.pending.lock();
        if pending.total >= self.config.max_buffered {
            return false;
        }
        pending.by_trace.entry(span.trace_id).or_default().push(span);
        pending.total += 1;
        true
    }
}

impl Recorder for BatchRecorder {
    fn record_span(&self, span: Span) {
        let counter = if self.push(span) {
            &self.metrics.recorded
        } else {
            &self.metrics.dropped
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanKind;

    fn span(trace_id: u128, span_id: u64) -> Span {
        Span::new(trace_id, span_id, 0, format!("op-{span_id}"), SpanKind::Internal)
    }

    #[test]
    fn test_batch_becomes_due_at_size_limit() {
        let recorder = BatchRecorder::new(RecorderConfig {
            batch_size_limit: 5,
            batch_timeout: Duration::from_secs(60),
            ..RecorderConfig::default()
        });

        for i in 0..4 {
            recorder.record_span(span(1, i));
        }
        assert!(!recorder.should_flush());

        recorder.record_span(span(2, 4));
        assert!(recorder.should_flush());

        let batch = recorder.take_batch().unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(recorder.total_pending(), 0);
        assert!(recorder.take_batch().is_none());
        assert_eq!(recorder.metrics().batches_taken(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_becomes_due_with_age() {
        let recorder = BatchRecorder::new(RecorderConfig {
            batch_timeout: Duration::from_millis(100),
            ..RecorderConfig::default()
        });
        recorder.record_span(span(1, 1));
        assert!(!recorder.should_flush());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(recorder.should_flush());
    }

    #[test]
    fn test_overflow_is_dropped() {
        let recorder = BatchRecorder::new(RecorderConfig {
            max_buffered: 3,
            ..RecorderConfig::default()
        });
        for i in 0..5 {
            recorder.record_span(span(1, i));
        }
        assert_eq!(recorder.total_pending(), 3);
        assert_eq!(recorder.metrics().recorded(), 3);
        assert_eq!(recorder.metrics().dropped(), 2);
    }

    #[test]
    fn test_restore_requeues_a_batch() {
        let recorder = BatchRecorder::default();
        recorder.record_span(span(1, 1));
        recorder.record_span(span(3, 2));

        let batch = recorder.take_batch().unwrap();
        recorder.restore(batch);

        assert_eq!(recorder.total_pending(), 2);
        assert_eq!(recorder.metrics().recorded(), 2);
    }
}
