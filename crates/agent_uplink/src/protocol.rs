//! Wire types and paths of the agent HTTP protocol.

use serde::{Deserialize, Serialize};

/// Announce endpoint (`PUT`).
pub const DISCOVERY_PATH: &str = "/discovery";

/// Root path, probed with `HEAD` during host lookup.
pub const AGENT_ROOT_PATH: &str = "/";

/// Entity-scoped metrics endpoint; also the readiness probe target.
pub const METRICS_PATH: &str = "/metrics.";

/// Entity-scoped span endpoint.
pub const SPANS_PATH: &str = "/traces.";

/// Entity-scoped profile endpoint.
pub const PROFILES_PATH: &str = "/profiles.";

/// Generic event endpoint (not entity-scoped).
pub const EVENT_PATH: &str = "/event";

/// Templates ending in this character get the entity id appended.
pub const ENTITY_SEPARATOR: char = '.';

/// Response header carrying the agent marker.
pub const SERVER_HEADER: &str = "server";

/// Body of the announce call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    pub pid: u32,
    pub process_name: String,
    pub args: Vec<String>,
}

impl DiscoveryRequest {
    /// Describes the current process.
    pub fn current() -> Self {
        let mut argv = std::env::args();
        let argv0 = argv.next();
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .or(argv0)
            .unwrap_or_default();

        Self {
            pid: std::process::id(),
            process_name,
            args: argv.collect(),
        }
    }
}

/// Agent's answer to the announce call.
///
/// `pid` is the process id as the agent sees it, which differs from ours when
/// we run in a separate pid namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    pub pid: u32,
    pub agent_uuid: String,
}

/// Identity of this process as known to the agent.
///
/// Created on a successful announce and replaced as a whole on the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    #[serde(rename = "e")]
    pub entity_id: String,
    #[serde(rename = "h")]
    pub host_id: String,
    #[serde(rename = "hl", default, skip_serializing_if = "std::ops::Not::not")]
    pub serverless: bool,
    #[serde(rename = "cp", default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
}

impl From<DiscoveryResponse> for AgentIdentity {
    fn from(response: DiscoveryResponse) -> Self {
        Self {
            entity_id: response.pid.to_string(),
            host_id: response.agent_uuid,
            serverless: false,
            cloud_provider: None,
        }
    }
}

/// Severity of an [`AgentEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum EventSeverity {
    Change,
    Warning,
    Critical,
}

impl From<EventSeverity> for i8 {
    fn from(severity: EventSeverity) -> Self {
        match severity {
            EventSeverity::Change => -1,
            EventSeverity::Warning => 5,
            EventSeverity::Critical => 10,
        }
    }
}

impl TryFrom<i8> for EventSeverity {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Change),
            5 => Ok(Self::Warning),
            10 => Ok(Self::Critical),
            other => Err(format!("unknown event severity {other}")),
        }
    }
}

/// A generic event shown alongside the process in the agent's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub title: String,
    pub text: String,
    /// Milliseconds.
    pub duration: u64,
    pub severity: EventSeverity,
}
