//! Bounded buffer for spans that finished before their data was complete.
//!
//! An HTTP server span can end before the response headers have been seen, or
//! while its captured query parameters still need redacting. Such spans are
//! parked here with their pending context and flushed once the agent is
//! ready: each entry is enriched, forwarded to the [`Recorder`] and removed.
//!
//! The buffer never blocks a producer. A full buffer drops the new entry; a
//! span id that is already queued is ignored. Every entry leaves the buffer at
//! most once, whichever consumer takes it.

use crate::span::{AttributeValue, Span};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Default number of entries the buffer holds.
pub const DEFAULT_CAPACITY: usize = 500;

/// Sink for finished spans.
pub trait Recorder: Send + Sync {
    fn record_span(&self, span: Span);
}

/// Redacts secrets from captured key/value pairs.
pub trait SecretRedactor: Send + Sync {
    fn redact(&self, values: Vec<(String, String)>) -> Vec<(String, String)>;
}

impl<F> SecretRedactor for F
where
    F: Fn(Vec<(String, String)>) -> Vec<(String, String)> + Send + Sync,
{
    fn redact(&self, values: Vec<(String, String)>) -> Vec<(String, String)> {
        self(values)
    }
}

/// Masks the value of every pair whose key contains one of the keywords
/// (case-insensitive).
#[derive(Debug, Clone)]
pub struct KeywordRedactor {
    keywords: Vec<String>,
}

impl KeywordRedactor {
    pub const MASK: &'static str = "<redacted>";

    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Default for KeywordRedactor {
    fn default() -> Self {
        Self::new(["key", "pass", "pwd", "secret", "token"])
    }
}

impl SecretRedactor for KeywordRedactor {
    fn redact(&self, values: Vec<(String, String)>) -> Vec<(String, String)> {
        values
            .into_iter()
            .map(|(key, value)| {
                let lowered = key.to_ascii_lowercase();
                if self.keywords.iter().any(|k| lowered.contains(k.as_str())) {
                    (key, Self::MASK.to_string())
                } else {
                    (key, value)
                }
            })
            .collect()
    }
}

/// Answers whether data can be delivered right now.
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self) -> bool;
}

impl ReadinessProbe for AtomicBool {
    fn is_ready(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl ReadinessProbe for crate::fsm::ConnectivityStateMachine {
    fn is_ready(&self) -> bool {
        crate::fsm::ConnectivityStateMachine::is_ready(self)
    }
}

impl<F> ReadinessProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

/// Data captured alongside a span that still has to be merged into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingContext {
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
}

impl PendingContext {
    pub fn is_empty(&self) -> bool {
        self.request_headers.is_empty() && self.response_headers.is_empty() && self.params.is_empty()
    }
}

/// A span waiting for enrichment and transmission.
#[derive(Debug, Clone)]
pub struct DelayedSpanEntry {
    pub span: Span,
    pub pending: PendingContext,
    pub enqueued_at: Instant,
}

impl DelayedSpanEntry {
    pub fn new(span: Span, pending: PendingContext) -> Self {
        Self {
            span,
            pending,
            enqueued_at: Instant::now(),
        }
    }

    pub fn span_id(&self) -> u64 {
        self.span.span_id
    }

    /// Merges the pending context into the span.
    ///
    /// Parameters go through `redactor` and land in `http.params` as a query
    /// string; headers become `http.request.header.<name>` and
    /// `http.response.header.<name>` attributes (names lowercased).
    pub fn enrich(self, redactor: &dyn SecretRedactor) -> Span {
        let Self { mut span, pending, .. } = self;

        if !pending.params.is_empty() {
            let params = redactor
                .redact(pending.params)
                .into_iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("&");
            span.set_attribute("http.params", params);
        }
        for (prefix, headers) in [
            ("http.request.header.", pending.request_headers),
            ("http.response.header.", pending.response_headers),
        ] {
            for (name, value) in headers {
                span.set_attribute(
                    format!("{prefix}{}", name.to_ascii_lowercase()),
                    AttributeValue::String(value),
                );
            }
        }
        span
    }
}

/// What [`DeferredSpanBuffer::enqueue`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// An entry with the same span id is already queued; the new one is ignored.
    Duplicate,
    /// The buffer is full; the entry is discarded.
    Dropped,
}

/// Buffer counters.
#[derive(Debug, Default)]
pub struct BufferMetrics {
    pub queued: AtomicU64,
    pub duplicates: AtomicU64,
    pub dropped: AtomicU64,
    pub flushed: AtomicU64,
}

impl BufferMetrics {
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Slots {
    entries: VecDeque<DelayedSpanEntry>,
    tracked: HashSet<u64>,
}

/// Fixed-capacity, drop-on-full, at-most-once span buffer.
///
/// Queue and id set share one lock, so the capacity check, the duplicate
/// check and the insert are a single atomic step. The lock is never held
/// while enriching or recording.
#[derive(Debug)]
pub struct DeferredSpanBuffer {
    slots: Mutex<Slots>,
    capacity: usize,
    metrics: BufferMetrics,
}

impl Default for DeferredSpanBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredSpanBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: VecDeque::with_capacity(capacity),
                tracked: HashSet::with_capacity(capacity),
            }),
            capacity,
            metrics: BufferMetrics::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    /// Adds `entry` unless the buffer is full or already tracks its span.
    /// Never blocks on anything but the short internal lock.
    pub fn enqueue(&self, entry: DelayedSpanEntry) -> EnqueueOutcome {
        let outcome = {
            let mut slots = self.slots.lock();
            if slots.tracked.contains(&entry.span_id()) {
                EnqueueOutcome::Duplicate
            } else if slots.entries.len() >= self.capacity {
                EnqueueOutcome::Dropped
            } else {
                slots.tracked.insert(entry.span_id());
                slots.entries.push_back(entry);
                debug_assert!(slots.entries.len() <= self.capacity);
                EnqueueOutcome::Queued
            }
        };

        let counter = match outcome {
            EnqueueOutcome::Queued => &self.metrics.queued,
            EnqueueOutcome::Duplicate => &self.metrics.duplicates,
            EnqueueOutcome::Dropped => &self.metrics.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Removes and returns one entry.
    pub fn pop(&self) -> Option<DelayedSpanEntry> {
        let mut slots = self.slots.lock();
        let entry = slots.entries.pop_front()?;
        slots.tracked.remove(&entry.span_id());
        Some(entry)
    }

    /// Lazily removes entries as they are yielded.
    ///
    /// Any number of consumers may drain at once; they partition the entries
    /// between them. The iterator ends when the buffer is empty.
    pub fn drain(&self) -> Drain<'_> {
        Drain { buffer: self }
    }

    /// Moves entries out while `ready()` holds.
    ///
    /// `ready` is checked before every entry; the first `false` stops the
    /// flush and leaves the rest queued for the next cycle. Returns the number
    /// of entries forwarded.
    pub fn flush<R, E, F>(&self, ready: R, mut enrich: E, mut forward: F) -> usize
    where
        R: Fn() -> bool,
        E: FnMut(DelayedSpanEntry) -> Span,
        F: FnMut(Span),
    {
        let mut flushed = 0;
        while ready() {
            let Some(entry) = self.pop() else {
                break;
            };
            forward(enrich(entry));
            flushed += 1;
        }
        self.metrics
            .flushed
            .fetch_add(flushed as u64, Ordering::Relaxed);
        flushed
    }

    /// The standard flush: redact and merge the pending context, then record.
    pub fn flush_to(
        &self,
        readiness: &dyn ReadinessProbe,
        redactor: &dyn SecretRedactor,
        recorder: &dyn Recorder,
    ) -> usize {
        self.flush(
            || readiness.is_ready(),
            |entry| entry.enrich(redactor),
            |span| recorder.record_span(span),
        )
    }
}

/// Iterator returned by [`DeferredSpanBuffer::drain`].
pub struct Drain<'a> {
    buffer: &'a DeferredSpanBuffer,
}

impl Iterator for Drain<'_> {
    type Item = DelayedSpanEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.pop()
    }
}
