//! Agent Uplink
//!
//! Data-delivery core of a tracing library: keeps a self-healing connection to
//! the host-local trace agent and parks spans that cannot be sent yet.
//!
//! - [`ConnectivityStateMachine`] discovers the agent, announces the process
//!   and tests the data endpoint, retrying each step with backoff.
//! - [`AgentCommunicator`] speaks the agent's HTTP protocol over a pluggable
//!   [`Transport`].
//! - [`DeferredSpanBuffer`] holds up to 500 spans awaiting enrichment;
//!   [`DeferredFlusher`] drains it once the agent is ready.
//! - [`HostAgent`] ties the pieces together behind [`AgentClient`].
//!
//! Traits use native async fn; each async seam has a `*Boxed` twin or a
//! concrete type for dynamic dispatch.

pub mod agent;
pub mod backoff;
pub mod communicator;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod flusher;
pub mod fsm;
pub mod gateway;
pub mod protocol;
pub mod recorder;
pub mod span;
pub mod transport;

#[cfg(test)]
mod test_logs;

// Re-export main types
pub use agent::{AgentClient, HostAgent, HostAgentBuilder};
pub use backoff::RetryCounter;
pub use communicator::AgentCommunicator;
pub use config::{AgentConfig, FlushConfig, RetryPolicy};
pub use context::{ConnectivityContext, ConnectivityState, Endpoint, HandshakeEvent};
pub use deferred::{
    BufferMetrics, DeferredSpanBuffer, DelayedSpanEntry, EnqueueOutcome, KeywordRedactor,
    PendingContext, ReadinessProbe, Recorder, SecretRedactor,
};
pub use error::{AgentError, ConfigError};
pub use flusher::{DeferredFlusher, FlushMetrics};
pub use fsm::{ConnectivityStateMachine, HandshakeStats};
pub use protocol::{AgentEvent, AgentIdentity, EventSeverity};
pub use recorder::{BatchRecorder, RecorderConfig, RecorderMetrics};
pub use span::{AttributeValue, Span, SpanBatch, SpanKind, SpanStatus};
pub use transport::{AgentRequest, AgentResponse, ReqwestTransport, Transport, TransportBoxed};
