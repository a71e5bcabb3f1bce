//! Error types for agent communication.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while talking to the local agent.
///
/// None of these ever reach instrumented application code: the state machine
/// turns them into retries, the deferred buffer into drops, and the agent
/// facade into a reset once they persist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Connection refused, reset, DNS failure and friends.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent answered with a non-2xx status.
    #[error("agent responded with status {status}")]
    Status { status: u16 },

    /// The request deadline expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request body could not be encoded as JSON.
    #[error("failed to encode request body: {0}")]
    Encode(String),

    /// The response body was not the JSON we expected.
    #[error("failed to decode response body: {0}")]
    Decode(String),

    /// The encoded payload is over the size cap; nothing was sent.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A host answered the probe but is not the agent.
    #[error("host {host} did not identify itself as the agent")]
    NotAgent { host: String },

    /// None of the candidate hosts is an agent.
    #[error("no agent host found")]
    HostNotFound,

    /// Data was offered before the handshake completed.
    #[error("agent connection is not ready")]
    NotReady,
}

impl AgentError {
    /// Returns `true` for failures that are expected to clear up on their own
    /// (the agent restarting, a port not yet open, a slow response).
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Status { .. }
                | Self::Timeout(_)
                | Self::Decode(_)
                | Self::NotAgent { .. }
                | Self::HostNotFound
        )
    }

    /// Returns `true` if sending the same payload again could succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PayloadTooLarge { .. } | Self::Encode(_))
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed.
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_too_large_is_not_retryable() {
        let err = AgentError::PayloadTooLarge {
            size: 10,
            limit: 5,
        };
        assert!(!err.is_retryable());
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "payload of 10 bytes exceeds the 5 byte limit"
        );
    }

    #[test]
    fn test_transport_failures_are_transient() {
        for err in [
            AgentError::Transport("connection refused".into()),
            AgentError::Status { status: 404 },
            AgentError::Timeout(Duration::from_secs(1)),
            AgentError::HostNotFound,
        ] {
            assert!(err.is_transient(), "{err} should be transient");
            assert!(err.is_retryable(), "{err} should be retryable");
        }
    }

    #[test]
    fn test_not_ready_is_retryable_but_not_transient() {
        assert!(AgentError::NotReady.is_retryable());
        assert!(!AgentError::NotReady.is_transient());
    }
}
