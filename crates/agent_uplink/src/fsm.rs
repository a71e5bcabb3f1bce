//! Connectivity state machine: lookup → announce → test, with backoff.
//!
//! One driver task owns every transition. It runs the step the current state
//! calls for, applies the matching [`HandshakeEvent`] on success and sleeps the
//! backoff delay on failure. Commands (`Reset`) reach it over a channel, and a
//! [`CancellationToken`] stops it. Both interrupt an in-flight step or backoff
//! sleep, so a reset or shutdown never leaves a stray retry behind.
//!
//! ```text
//!  Uninitialized ──init──► Init ──lookup──► Unannounced ──announce──► Announced ──test──► Ready
//!                           ▲                                                              │
//!                           └──────────────────────── reset (any state) ◄──────────────────┘
//! ```
//!
//! Reads (`current_state`, `is_ready`, `identity`) go straight to the shared
//! [`ConnectivityContext`] and never wait on network I/O.

use crate::backoff::RetryCounter;
use crate::communicator::AgentCommunicator;
use crate::config::AgentConfig;
use crate::context::{ConnectivityContext, ConnectivityState, HandshakeEvent};
use crate::error::AgentError;
use crate::gateway;
use crate::protocol::{
    AgentIdentity, DiscoveryRequest, DiscoveryResponse, AGENT_ROOT_PATH, DISCOVERY_PATH,
    METRICS_PATH,
};
use parking_lot::Mutex;
use reqwest::Method;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Host tried when none is configured.
pub const LOCALHOST: &str = "localhost";

/// Handshake counters, updated by the driver and readable from anywhere.
#[derive(Debug, Default)]
pub struct HandshakeStats {
    /// Steps that succeeded and advanced the state.
    pub steps_completed: AtomicU64,
    /// Failed steps (each one schedules a retry).
    pub total_retries: AtomicU64,
    /// Resets that sent the machine back to `Init`.
    pub resets: AtomicU64,
    /// Mirror of the driver's retry counter.
    pub attempts_remaining: AtomicU32,
}

// Statistical counters only: nothing synchronizes through them, so Relaxed.
impl HandshakeStats {
    pub fn steps_completed(&self) -> u64 {
        self.steps_completed.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum Command {
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Lookup,
    Announce,
    Test,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Announce => "announce",
            Self::Test => "test",
        }
    }
}

/// What a successful step learned.
enum StepOutput {
    HostFound(String),
    Announced(AgentIdentity),
    Tested,
}

enum Flow {
    Continue,
    Stop,
}

/// Handle to the running handshake.
pub struct ConnectivityStateMachine {
    context: Arc<ConnectivityContext>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    stats: Arc<HandshakeStats>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityStateMachine {
    /// Spawns the driver on the current tokio runtime and enters `Init`.
    pub fn start(config: &AgentConfig, communicator: Arc<AgentCommunicator>) -> Self {
        let context = Arc::clone(communicator.context());
        let stats = Arc::new(HandshakeStats::default());
        let retry = RetryCounter::new(config.retry.clone());
        stats
            .attempts_remaining
            .store(retry.attempts_remaining(), Ordering::Relaxed);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            communicator,
            context: Arc::clone(&context),
            stats: Arc::clone(&stats),
            retry,
            configured_host: config.host.clone(),
            server_header: config.server_header.clone(),
            handshake_timeout: config.handshake_timeout,
            announce_timeout: config.announce_timeout,
            route_table_path: config.route_table_path.clone(),
        };
        let task = tokio::spawn(driver.run(command_rx, cancel.clone()));

        Self {
            context,
            commands,
            cancel,
            stats,
            driver: Mutex::new(Some(task)),
        }
    }

    pub fn current_state(&self) -> ConnectivityState {
        self.context.state()
    }

    pub fn is_ready(&self) -> bool {
        self.context.is_ready()
    }

    pub fn identity(&self) -> Option<AgentIdentity> {
        self.context.identity()
    }

    pub fn context(&self) -> &Arc<ConnectivityContext> {
        &self.context
    }

    pub fn stats(&self) -> &HandshakeStats {
        &self.stats
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.context.subscribe()
    }

    /// Sends the machine back to `Init` to rediscover the agent.
    ///
    /// Asynchronous: the driver applies the reset, abandoning whatever step or
    /// backoff it was in. Use [`wait_for_state`](Self::wait_for_state) to
    /// observe the result.
    pub fn trigger_reset(&self) {
        if self.commands.send(Command::Reset).is_err() {
            debug!("reset requested after the handshake driver stopped");
        }
    }

    /// Waits until the machine is in `state`; `false` if `timeout` elapses first.
    pub async fn wait_for_state(&self, state: ConnectivityState, timeout: Duration) -> bool {
        let mut changes = self.context.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, changes.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Stops the driver and waits for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.driver.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "handshake driver panicked");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ConnectivityStateMachine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    communicator: Arc<AgentCommunicator>,
    context: Arc<ConnectivityContext>,
    stats: Arc<HandshakeStats>,
    retry: RetryCounter,
    configured_host: Option<String>,
    server_header: String,
    handshake_timeout: Duration,
    announce_timeout: Duration,
    route_table_path: PathBuf,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        self.context.apply(HandshakeEvent::Init);
        info!(port = self.context.port(), "starting agent handshake");

        loop {
            let step = match self.context.state() {
                ConnectivityState::Uninitialized => {
                    self.context.apply(HandshakeEvent::Init);
                    continue;
                }
                ConnectivityState::Init => Step::Lookup,
                ConnectivityState::Unannounced => Step::Announce,
                ConnectivityState::Announced => Step::Test,
                ConnectivityState::Ready => {
                    let flow = tokio::select! {
                        () = cancel.cancelled() => Flow::Stop,
                        command = commands.recv() => self.handle(command),
                    };
                    match flow {
                        Flow::Continue => continue,
                        Flow::Stop => break,
                    }
                }
            };

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match self.handle(command) {
                    Flow::Continue => continue,
                    Flow::Stop => break,
                },
                outcome = self.execute(step) => outcome,
            };

            match outcome {
                Ok(output) => self.complete(step, output),
                Err(err) => {
                    let delay = self.fail(step, &err);
                    let flow = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Flow::Stop,
                        command = commands.recv() => self.handle(command),
                        () = tokio::time::sleep(delay) => Flow::Continue,
                    };
                    if let Flow::Stop = flow {
                        break;
                    }
                }
            }
        }

        debug!("handshake driver stopped");
    }

    fn handle(&mut self, command: Option<Command>) -> Flow {
        match command {
            Some(Command::Reset) => {
                let from = self.context.state();
                if self.context.apply(HandshakeEvent::Init).is_some() {
                    self.stats.resets.fetch_add(1, Ordering::Relaxed);
                    info!(%from, "agent handshake reset, rediscovering agent");
                } else {
                    debug!(%from, "reset while looking up the agent, restarting lookup");
                }
                self.retry.reset();
                self.publish_attempts();
                Flow::Continue
            }
            None => Flow::Stop,
        }
    }

    async fn execute(&self, step: Step) -> Result<StepOutput, AgentError> {
        match step {
            Step::Lookup => self.lookup().await.map(StepOutput::HostFound),
            Step::Announce => self.announce().await.map(StepOutput::Announced),
            Step::Test => self.test().await.map(|()| StepOutput::Tested),
        }
    }

    fn complete(&mut self, step: Step, output: StepOutput) {
        let next = match output {
            StepOutput::HostFound(host) => {
                info!(%host, "found agent host");
                self.context.complete_lookup(host)
            }
            StepOutput::Announced(identity) => {
                info!(entity_id = %identity.entity_id, host_id = %identity.host_id, "announced to agent");
                self.context.complete_announce(identity)
            }
            StepOutput::Tested => self.context.apply(HandshakeEvent::TestSucceeded),
        };

        debug_assert!(next.is_some(), "driver ran {step:?} in a state that rejects its event");
        match next {
            Some(state) => {
                self.stats.steps_completed.fetch_add(1, Ordering::Relaxed);
                self.retry.record_success();
                self.publish_attempts();
                if state == ConnectivityState::Ready {
                    info!("agent connection ready");
                } else {
                    debug!(step = step.as_str(), %state, "handshake step succeeded");
                }
            }
            None => {
                warn!(step = step.as_str(), state = %self.context.state(), "handshake step result discarded");
            }
        }
    }

    fn fail(&mut self, step: Step, err: &AgentError) -> Duration {
        let was_exhausted = self.retry.is_exhausted();
        let delay = self.retry.record_failure();
        self.stats.total_retries.fetch_add(1, Ordering::Relaxed);
        self.publish_attempts();

        // Request failures were already reported by the communicator.
        debug!(
            step = step.as_str(),
            attempt = self.retry.consecutive_failures(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "handshake step failed, retrying"
        );

        if self.retry.is_exhausted() && !was_exhausted {
            warn!(
                step = step.as_str(),
                max_attempts = self.retry.max_attempts(),
                "handshake retries exhausted, continuing at maximum backoff"
            );
        }
        delay
    }

    fn publish_attempts(&self) {
        self.stats
            .attempts_remaining
            .store(self.retry.attempts_remaining(), Ordering::Relaxed);
    }

    /// Configured host (or `localhost`), then the default gateway.
    async fn lookup(&self) -> Result<String, AgentError> {
        let first = self
            .configured_host
            .clone()
            .unwrap_or_else(|| LOCALHOST.to_string());

        if self.check_host(&first).await.is_ok() {
            return Ok(first);
        }

        let Some(gateway) = gateway::default_gateway(&self.route_table_path).await else {
            return Err(AgentError::HostNotFound);
        };
        let gateway = gateway.to_string();
        if gateway == first {
            return Err(AgentError::HostNotFound);
        }

        match self.check_host(&gateway).await {
            Ok(()) => Ok(gateway),
            Err(_) => Err(AgentError::HostNotFound),
        }
    }

    /// A host is the agent iff `HEAD /` succeeds with the expected `Server`.
    async fn check_host(&self, host: &str) -> Result<(), AgentError> {
        let url = format!("{}{}", self.communicator.base_url(host), AGENT_ROOT_PATH);
        let server = self.communicator.probe(&url, self.handshake_timeout).await?;
        if server.as_deref() == Some(self.server_header.as_str()) {
            Ok(())
        } else {
            warn!(%host, server = ?server, "host answered but is not the agent");
            Err(AgentError::NotAgent {
                host: host.to_string(),
            })
        }
    }

    async fn announce(&self) -> Result<AgentIdentity, AgentError> {
        let url = self.communicator.build_url(DISCOVERY_PATH);
        let request = DiscoveryRequest::current();
        debug!(pid = request.pid, process = %request.process_name, "announcing to agent");

        let response: DiscoveryResponse = self
            .communicator
            .exchange_json(Method::PUT, &url, Some(&request), self.announce_timeout)
            .await?;
        Ok(AgentIdentity::from(response))
    }

    async fn test(&self) -> Result<(), AgentError> {
        let url = self.communicator.build_url(METRICS_PATH);
        self.communicator
            .probe(&url, self.handshake_timeout)
            .await
            .map(drop)
    }
}
