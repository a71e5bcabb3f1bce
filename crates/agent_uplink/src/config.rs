//! Configuration for the agent connection and the deferred flush cycle.

use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

/// Port the host agent listens on unless told otherwise.
pub const DEFAULT_AGENT_PORT: u16 = 42699;

/// Value the agent puts in the `Server` header of every response.
pub const DEFAULT_SERVER_HEADER: &str = "Trace Agent";

/// Encoded payloads above this size are rejected before any network call.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 5 * 1024 * 1024;

/// Environment variable naming the agent host.
pub const ENV_AGENT_HOST: &str = "TRACER_AGENT_HOST";

/// Environment variable naming the agent port.
pub const ENV_AGENT_PORT: &str = "TRACER_AGENT_PORT";

/// Retry schedule for failed handshake steps.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failures tolerated before the counter reports exhaustion.
    ///
    /// Exhaustion is only reported; the step keeps being retried at the
    /// ceiling delay.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double delay each retry).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed, 0 means no delay).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        // `as` saturates, so an infinite product lands on u64::MAX and is capped below.
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Everything the connectivity layer needs to find and talk to the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Explicitly configured agent host. `None` means try `localhost`, then
    /// the default gateway.
    pub host: Option<String>,
    /// Agent port.
    pub port: u16,
    /// Expected `Server` header value identifying the agent.
    pub server_header: String,
    /// Deadline for host probes and readiness tests.
    pub handshake_timeout: Duration,
    /// Deadline for the announce call.
    pub announce_timeout: Duration,
    /// Deadline for data submissions.
    pub request_timeout: Duration,
    /// Maximum encoded payload size in bytes.
    pub max_payload_size: usize,
    /// Backoff schedule for failed handshake steps.
    pub retry: RetryPolicy,
    /// Consecutive failed sends in `Ready` before the handshake is restarted.
    pub failures_before_reset: u32,
    /// Kernel routing table used to find the default gateway.
    pub route_table_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_AGENT_PORT,
            server_header: DEFAULT_SERVER_HEADER.to_string(),
            handshake_timeout: Duration::from_secs(5),
            announce_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            retry: RetryPolicy::default(),
            failures_before_reset: 2,
            route_table_path: PathBuf::from("/proc/net/route"),
        }
    }
}

impl AgentConfig {
    /// Short timeouts and millisecond backoff, for tests and local development.
    pub fn fast_handshake() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(500),
            announce_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
            },
            ..Self::default()
        }
    }

    /// Reads `TRACER_AGENT_HOST` and `TRACER_AGENT_PORT` on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_AGENT_HOST) {
            let host = host.trim();
            if !host.is_empty() {
                config.host = Some(host.to_string());
            }
        }

        if let Some(port) = lookup(ENV_AGENT_PORT) {
            config.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_AGENT_PORT,
                value: port.clone(),
            })?;
        }

        Ok(config)
    }

    /// Sets the agent host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the agent port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum encoded payload size.
    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Sets how many consecutive send failures trigger a reset.
    pub fn with_failures_before_reset(mut self, failures: u32) -> Self {
        self.failures_before_reset = failures;
        self
    }

    /// Sets the routing table consulted for the default gateway.
    pub fn with_route_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.route_table_path = path.into();
        self
    }
}

/// Shortest flush interval; a zero-length period would spin.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for the periodic deferred-span flush.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Time between flush cycles.
    ///
    /// Default: 1s
    pub interval: Duration,

    /// Concurrent flush workers per cycle.
    ///
    /// Default: 2
    pub workers: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            workers: 2,
        }
    }
}

impl FlushConfig {
    /// Sets the flush interval (at least [`MIN_FLUSH_INTERVAL`]).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_FLUSH_INTERVAL);
        self
    }

    /// Sets the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
