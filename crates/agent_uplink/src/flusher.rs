//! Periodic flush of the deferred span buffer.
//!
//! Each tick checks readiness and, if the agent is ready, runs a small pool
//! of workers that drain the buffer concurrently through
//! [`DeferredSpanBuffer::flush_to`]. The buffer hands each entry to exactly
//! one worker.

use crate::config::{FlushConfig, MIN_FLUSH_INTERVAL};
use crate::deferred::{DeferredSpanBuffer, ReadinessProbe, Recorder, SecretRedactor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Flush cycle counters.
#[derive(Debug, Default)]
pub struct FlushMetrics {
    /// Ticks that ran workers.
    pub cycles: AtomicU64,
    /// Ticks skipped because the agent was not ready.
    pub skipped: AtomicU64,
    /// Entries forwarded to the recorder.
    pub spans_flushed: AtomicU64,
}

impl FlushMetrics {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn spans_flushed(&self) -> u64 {
        self.spans_flushed.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct Sinks {
    buffer: Arc<DeferredSpanBuffer>,
    readiness: Arc<dyn ReadinessProbe>,
    redactor: Arc<dyn SecretRedactor>,
    recorder: Arc<dyn Recorder>,
}

impl Sinks {
    fn flush_once(&self) -> usize {
        self.buffer
            .flush_to(self.readiness.as_ref(), self.redactor.as_ref(), self.recorder.as_ref())
    }
}

/// Background task flushing a [`DeferredSpanBuffer`] on an interval.
pub struct DeferredFlusher {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<FlushMetrics>,
}

impl DeferredFlusher {
    /// Spawns the flush loop on the current tokio runtime.
    pub fn start(
        buffer: Arc<DeferredSpanBuffer>,
        readiness: Arc<dyn ReadinessProbe>,
        redactor: Arc<dyn SecretRedactor>,
        recorder: Arc<dyn Recorder>,
        config: FlushConfig,
    ) -> Self {
        let sinks = Sinks {
            buffer,
            readiness,
            redactor,
            recorder,
        };
        let cancel = CancellationToken::new();
        let metrics = Arc::new(FlushMetrics::default());
        let task = tokio::spawn(run(sinks, config, cancel.clone(), Arc::clone(&metrics)));

        Self {
            cancel,
            task: Mutex::new(Some(task)),
            metrics,
        }
    }

    pub fn metrics(&self) -> &FlushMetrics {
        &self.metrics
    }

    /// Stops the loop after one last flush (if the agent is ready) and waits
    /// for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "deferred flusher panicked");
            }
        }
    }
}

impl Drop for DeferredFlusher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(sinks: Sinks, config: FlushConfig, cancel: CancellationToken, metrics: Arc<FlushMetrics>) {
    let mut interval = tokio::time::interval(config.interval.max(MIN_FLUSH_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let workers = config.workers.max(1);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = interval.tick() => {
                if !sinks.readiness.is_ready() {
                    metrics.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if sinks.buffer.is_empty() {
                    continue;
                }

                let mut pool = JoinSet::new();
                for _ in 0..workers {
                    let sinks = sinks.clone();
                    pool.spawn(async move { sinks.flush_once() });
                }

                let mut flushed = 0;
                while let Some(result) = pool.join_next().await {
                    match result {
                        Ok(count) => flushed += count,
                        Err(err) => error!(error = %err, "flush worker panicked"),
                    }
                }
                metrics.cycles.fetch_add(1, Ordering::Relaxed);
                metrics.spans_flushed.fetch_add(flushed as u64, Ordering::Relaxed);
                trace!(flushed, remaining = sinks.buffer.len(), "flush cycle");
            }
        }
    }

    // Best effort: whatever is still parked goes out if the agent can take it.
    if sinks.readiness.is_ready() {
        let flushed = sinks.flush_once();
        metrics.spans_flushed.fetch_add(flushed as u64, Ordering::Relaxed);
        debug!(flushed, "final deferred flush");
    } else if !sinks.buffer.is_empty() {
        debug!(remaining = sinks.buffer.len(), "agent not ready, deferred spans left behind");
    }
}
