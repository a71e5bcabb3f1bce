//! Entry point for instrumentation: readiness, data submission and span
//! routing, backed by the local host agent.

use crate::communicator::AgentCommunicator;
use crate::config::{AgentConfig, FlushConfig, MIN_FLUSH_INTERVAL};
use crate::context::ConnectivityContext;
use crate::deferred::{
    DeferredSpanBuffer, DelayedSpanEntry, EnqueueOutcome, KeywordRedactor, PendingContext,
    Recorder, SecretRedactor,
};
use crate::error::AgentError;
use crate::flusher::DeferredFlusher;
use crate::fsm::{ConnectivityStateMachine, LOCALHOST};
use crate::protocol::{AgentEvent, EVENT_PATH, METRICS_PATH, PROFILES_PATH, SPANS_PATH};
use crate::recorder::{BatchRecorder, RecorderConfig};
use crate::span::{Span, SpanBatch};
use crate::transport::{ReqwestTransport, TransportBoxed};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// What a tracing backend offers to instrumented code.
///
/// Uses native async fn in traits; every method is safe to call before the
/// backend is ready and fails with [`AgentError::NotReady`] instead of
/// blocking.
pub trait AgentClient: Send + Sync {
    fn ready(&self) -> bool;

    fn send_metrics(
        &self,
        metrics: &serde_json::Value,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;

    fn send_spans(&self, batch: &SpanBatch) -> impl Future<Output = Result<(), AgentError>> + Send;

    fn send_event(&self, event: &AgentEvent) -> impl Future<Output = Result<(), AgentError>> + Send;

    fn send_profiles(
        &self,
        profiles: &serde_json::Value,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Sends everything recorded so far; returns the number of spans sent.
    fn flush(&self) -> impl Future<Output = Result<usize, AgentError>> + Send;

    fn name(&self) -> &str;
}

/// Builds a [`HostAgent`].
pub struct HostAgentBuilder {
    config: AgentConfig,
    transport: Option<Arc<dyn TransportBoxed>>,
    redactor: Option<Arc<dyn SecretRedactor>>,
    flush: FlushConfig,
    recorder: RecorderConfig,
    buffer_capacity: Option<usize>,
}

impl HostAgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            transport: None,
            redactor: None,
            flush: FlushConfig::default(),
            recorder: RecorderConfig::default(),
            buffer_capacity: None,
        }
    }

    /// Replaces the HTTP transport (defaults to [`ReqwestTransport`]).
    pub fn with_transport(mut self, transport: Arc<dyn TransportBoxed>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the parameter redactor (defaults to [`KeywordRedactor`]).
    pub fn with_redactor(mut self, redactor: Arc<dyn SecretRedactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    /// Sets the tick of both background loops: deferred flushing and sending
    /// due batches.
    pub fn with_flush(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_recorder(mut self, recorder: RecorderConfig) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// Wires everything together and starts the handshake, the deferred
    /// flusher and the batch sender.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> HostAgent {
        let config = self.config;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
        let redactor = self
            .redactor
            .unwrap_or_else(|| Arc::new(KeywordRedactor::default()));

        let host = config.host.clone().unwrap_or_else(|| LOCALHOST.to_string());
        let context = Arc::new(ConnectivityContext::new(host, config.port));
        let communicator = Arc::new(AgentCommunicator::new(&config, context, transport));
        let machine = Arc::new(ConnectivityStateMachine::start(&config, Arc::clone(&communicator)));

        let buffer = Arc::new(match self.buffer_capacity {
            Some(capacity) => DeferredSpanBuffer::with_capacity(capacity),
            None => DeferredSpanBuffer::new(),
        });
        let recorder = Arc::new(BatchRecorder::new(self.recorder));
        let tick = self.flush.interval;
        let flusher = DeferredFlusher::start(
            Arc::clone(&buffer),
            machine.clone(),
            redactor,
            recorder.clone(),
            self.flush,
        );

        let uplink = Arc::new(Uplink {
            communicator,
            machine,
            recorder,
            consecutive_failures: AtomicU32::new(0),
            failures_before_reset: config.failures_before_reset.max(1),
        });
        let cancel = CancellationToken::new();
        let sender = tokio::spawn(send_due_batches(Arc::clone(&uplink), tick, cancel.clone()));

        info!(port = config.port, "host agent client started");
        HostAgent {
            uplink,
            buffer,
            flusher,
            cancel,
            sender: Mutex::new(Some(sender)),
        }
    }
}

/// State shared by client calls and the batch sender.
struct Uplink {
    communicator: Arc<AgentCommunicator>,
    machine: Arc<ConnectivityStateMachine>,
    recorder: Arc<BatchRecorder>,
    consecutive_failures: AtomicU32,
    failures_before_reset: u32,
}

impl Uplink {
    async fn deliver<B>(&self, template: &str, payload: &B) -> Result<(), AgentError>
    where
        B: Serialize + ?Sized + Sync,
    {
        if !self.machine.is_ready() {
            return Err(AgentError::NotReady);
        }
        let url = self.communicator.build_url(template);
        match self.communicator.send(&url, payload).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn record_failure(&self, err: &AgentError) {
        if !err.is_transient() {
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failures_before_reset {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            warn!(failures, error = %err, "agent unreachable, restarting handshake");
            self.machine.trigger_reset();
        }
    }

    async fn send_spans(&self, batch: &SpanBatch) -> Result<(), AgentError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.deliver(SPANS_PATH, batch).await
    }

    /// Sends the recorder's pending spans; a retryable failure puts them back.
    async fn send_recorded(&self) -> Result<usize, AgentError> {
        if !self.machine.is_ready() {
            return Err(AgentError::NotReady);
        }
        let Some(batch) = self.recorder.take_batch() else {
            return Ok(0);
        };
        let count = batch.len();
        match self.send_spans(&batch).await {
            Ok(()) => Ok(count),
            Err(err) => {
                if err.is_retryable() {
                    self.recorder.restore(batch);
                }
                Err(err)
            }
        }
    }
}

/// Sends the recorder's batch whenever it is due and the agent is ready.
async fn send_due_batches(uplink: Arc<Uplink>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period.max(MIN_FLUSH_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = interval.tick() => {
                if !uplink.machine.is_ready() || !uplink.recorder.should_flush() {
                    continue;
                }
                match uplink.send_recorded().await {
                    Ok(sent) => trace!(sent, "due batch sent"),
                    Err(err) => debug!(error = %err, "due batch not sent"),
                }
            }
        }
    }
}

/// [`AgentClient`] talking to the agent on the local host.
///
/// Data sends only go out while the handshake is `Ready`. Transient send
/// failures are counted; once `failures_before_reset` of them happen in a row
/// the handshake is restarted from lookup. Recorded spans are sent in the
/// background once a batch is due; [`flush`](AgentClient::flush) sends them
/// right away.
pub struct HostAgent {
    uplink: Arc<Uplink>,
    buffer: Arc<DeferredSpanBuffer>,
    flusher: DeferredFlusher,
    cancel: CancellationToken,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl HostAgent {
    pub fn builder(config: AgentConfig) -> HostAgentBuilder {
        HostAgentBuilder::new(config)
    }

    /// Production client over HTTP with default flush and recorder settings.
    pub fn connect(config: AgentConfig) -> Self {
        HostAgentBuilder::new(config).start()
    }

    pub fn machine(&self) -> &Arc<ConnectivityStateMachine> {
        &self.uplink.machine
    }

    pub fn communicator(&self) -> &Arc<AgentCommunicator> {
        &self.uplink.communicator
    }

    pub fn deferred(&self) -> &Arc<DeferredSpanBuffer> {
        &self.buffer
    }

    pub fn recorder(&self) -> &Arc<BatchRecorder> {
        &self.uplink.recorder
    }

    pub fn flusher(&self) -> &DeferredFlusher {
        &self.flusher
    }

    /// Routes a finished span: straight to the recorder when complete, into
    /// the deferred buffer when `pending` still has data to merge.
    pub fn finish_span(&self, span: Span, pending: PendingContext) -> EnqueueOutcome {
        if pending.is_empty() {
            self.uplink.recorder.record_span(span);
            return EnqueueOutcome::Queued;
        }
        let outcome = self.buffer.enqueue(DelayedSpanEntry::new(span, pending));
        if outcome != EnqueueOutcome::Queued {
            debug!(?outcome, "deferred span not queued");
        }
        outcome
    }

    /// Stops the batch sender and the flusher (with its final flush), sends
    /// what the recorder holds if the agent is still ready, then stops the
    /// handshake. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sender = self.sender.lock().take();
        if let Some(sender) = sender {
            if let Err(err) = sender.await {
                error!(error = %err, "batch sender panicked");
            }
        }
        self.flusher.shutdown().await;
        if self.uplink.machine.is_ready() {
            if let Err(err) = self.uplink.send_recorded().await {
                debug!(error = %err, "final span flush failed");
            }
        }
        self.uplink.machine.shutdown().await;
    }
}

impl Drop for HostAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl AgentClient for HostAgent {
    fn ready(&self) -> bool {
        self.uplink.machine.is_ready()
    }

    async fn send_metrics(&self, metrics: &serde_json::Value) -> Result<(), AgentError> {
        self.uplink.deliver(METRICS_PATH, metrics).await
    }

    async fn send_spans(&self, batch: &SpanBatch) -> Result<(), AgentError> {
        self.uplink.send_spans(batch).await
    }

    async fn send_event(&self, event: &AgentEvent) -> Result<(), AgentError> {
        self.uplink.deliver(EVENT_PATH, event).await
    }

    async fn send_profiles(&self, profiles: &serde_json::Value) -> Result<(), AgentError> {
        self.uplink.deliver(PROFILES_PATH, profiles).await
    }

    async fn flush(&self) -> Result<usize, AgentError> {
        self.uplink.send_recorded().await
    }

    fn name(&self) -> &str {
        "host-agent"
    }
}
