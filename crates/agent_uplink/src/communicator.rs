//! HTTP protocol adapter for the local agent.
//!
//! Stateless per call: every operation builds its request, runs it through the
//! transport under a deadline and classifies the outcome. The only shared
//! state it reads is the [`ConnectivityContext`] (host, port, identity, and
//! the handshake state that decides how loudly failures are logged).

use crate::config::AgentConfig;
use crate::context::{ConnectivityContext, ConnectivityState};
use crate::error::AgentError;
use crate::protocol::{ENTITY_SEPARATOR, SERVER_HEADER};
use crate::transport::{AgentRequest, AgentResponse, TransportBoxed};
use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Talks HTTP to the agent on behalf of the state machine and the facade.
pub struct AgentCommunicator {
    context: Arc<ConnectivityContext>,
    transport: Arc<dyn TransportBoxed>,
    max_payload_size: usize,
    request_timeout: Duration,
}

impl AgentCommunicator {
    pub fn new(
        config: &AgentConfig,
        context: Arc<ConnectivityContext>,
        transport: Arc<dyn TransportBoxed>,
    ) -> Self {
        Self {
            context,
            transport,
            max_payload_size: config.max_payload_size,
            request_timeout: config.request_timeout,
        }
    }

    pub fn context(&self) -> &Arc<ConnectivityContext> {
        &self.context
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// URL for `template` on the current agent host.
    ///
    /// Templates ending in `.` are entity-scoped: once an identity is known
    /// its entity id is appended. Anything else is used verbatim.
    pub fn build_url(&self, template: &str) -> String {
        let endpoint = self.context.endpoint();
        let mut url = base_url(&endpoint.host, endpoint.port);
        url.push_str(template);
        if template.ends_with(ENTITY_SEPARATOR) {
            if let Some(entity_id) = endpoint.entity_id {
                url.push_str(&entity_id);
            }
        }
        url
    }

    /// Base URL for a candidate host that has not been committed yet.
    pub fn base_url(&self, host: &str) -> String {
        base_url(host, self.context.port())
    }

    /// `HEAD url`; succeeds on 2xx and returns the `Server` header.
    pub async fn probe(&self, url: &str, timeout: Duration) -> Result<Option<String>, AgentError> {
        let request = AgentRequest::new(Method::HEAD, url, timeout);
        let response = self.execute(request).await?;
        Ok(response.header(SERVER_HEADER).map(str::to_owned))
    }

    /// JSON request/response round trip; returns the raw 2xx body.
    ///
    /// `body` is encoded as JSON; `None` sends no body.
    pub async fn exchange<B>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<Bytes, AgentError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = AgentRequest::new(method, url, timeout);
        if let Some(body) = body {
            let encoded = encode(body)?;
            request = request
                .with_header("content-type", CONTENT_TYPE_JSON)
                .with_body(encoded);
        }
        Ok(self.execute(request).await?.body)
    }

    /// [`exchange`](Self::exchange) plus decoding the response into `R`.
    pub async fn exchange_json<B, R>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<R, AgentError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = self.exchange(method, url, body, timeout).await?;
        serde_json::from_slice(&body).map_err(|e| {
            let err = AgentError::Decode(e.to_string());
            self.log_failure(url, &err);
            err
        })
    }

    /// POSTs `payload` as JSON under the data submission deadline.
    ///
    /// The size cap is checked on the encoded bytes before anything touches
    /// the network.
    pub async fn send<B>(&self, url: &str, payload: &B) -> Result<(), AgentError>
    where
        B: Serialize + ?Sized,
    {
        let encoded = encode(payload)?;
        if encoded.len() > self.max_payload_size {
            let err = AgentError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_payload_size,
            };
            warn!(url, error = %err, "dropping oversized payload");
            return Err(err);
        }

        let request = AgentRequest::new(Method::POST, url, self.request_timeout)
            .with_header("content-type", CONTENT_TYPE_JSON)
            .with_body(encoded);
        self.execute(request).await.map(drop)
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let url = request.url.clone();
        let deadline = request.timeout;

        let result = match tokio::time::timeout(deadline, self.transport.execute_boxed(request)).await
        {
            Ok(Ok(response)) if response.status.is_success() => Ok(response),
            Ok(Ok(response)) => Err(AgentError::Status {
                status: response.status.as_u16(),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AgentError::Timeout(deadline)),
        };

        if let Err(err) = &result {
            self.log_failure(&url, err);
        }
        result
    }

    /// Between announce and the first successful test the agent routinely
    /// answers 404 or refuses connections, so those failures stay at debug.
    fn log_failure(&self, url: &str, err: &AgentError) {
        let state = self.context.state();
        if state == ConnectivityState::Announced {
            debug!(%state, url, error = %err, "agent request failed");
        } else {
            warn!(%state, url, error = %err, "agent request failed");
        }
    }
}

fn base_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Vec<u8>, AgentError> {
    serde_json::to_vec(body).map_err(|e| AgentError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HandshakeEvent;
    use crate::protocol::{AgentIdentity, DiscoveryResponse, DISCOVERY_PATH, SPANS_PATH};
    use crate::transport::fake::FakeAgent;
    use reqwest::StatusCode;

    fn communicator(agent: Arc<FakeAgent>, config: &AgentConfig) -> AgentCommunicator {
        let context = Arc::new(ConnectivityContext::new("localhost", 42699));
        AgentCommunicator::new(config, context, agent)
    }

    fn announce(communicator: &AgentCommunicator, entity_id: &str) {
        let context = communicator.context();
        context.apply(HandshakeEvent::Init);
        context.complete_lookup("localhost".into());
        context.complete_announce(AgentIdentity {
            entity_id: entity_id.into(),
            host_id: "h".into(),
            serverless: false,
            cloud_provider: None,
        });
    }

    #[test]
    fn test_entity_scoped_url_gets_entity_id() {
        let c = communicator(Arc::new(FakeAgent::new()), &AgentConfig::default());
        announce(&c, "abc");

        assert_eq!(c.build_url("/plugin."), "http://localhost:42699/plugin.abc");
        assert_eq!(c.build_url(DISCOVERY_PATH), "http://localhost:42699/discovery");
    }

    #[test]
    fn test_template_verbatim_without_identity() {
        let c = communicator(Arc::new(FakeAgent::new()), &AgentConfig::default());
        assert_eq!(c.build_url(SPANS_PATH), "http://localhost:42699/traces.");
        assert_eq!(c.build_url("/discovery"), "http://localhost:42699/discovery");
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let c = communicator(Arc::new(FakeAgent::new()), &AgentConfig::default());
        assert_eq!(c.base_url("::1"), "http://[::1]:42699");
        assert_eq!(c.base_url("10.0.0.1"), "http://10.0.0.1:42699");
    }

    #[tokio::test]
    async fn test_oversized_payload_makes_no_network_call() {
        let agent = Arc::new(FakeAgent::new());
        let config = AgentConfig::default().with_max_payload_size(64);
        let c = communicator(agent.clone(), &config);

        let payload = vec!["x".repeat(100)];
        let err = c.send("http://localhost:42699/traces.1", &payload).await.unwrap_err();

        assert!(matches!(err, AgentError::PayloadTooLarge { limit: 64, .. }));
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_send_posts_json() {
        let agent = Arc::new(FakeAgent::new());
        let url = "http://localhost:42699/traces.1";
        agent.respond(Method::POST, url, StatusCode::NO_CONTENT, Vec::new(), "");
        let c = communicator(agent.clone(), &AgentConfig::default());

        c.send(url, &serde_json::json!({"spans": []})).await.unwrap();

        let requests = agent.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::POST);
        assert!(requests[0]
            .headers
            .contains(&("content-type", CONTENT_TYPE_JSON.to_string())));
        assert_eq!(requests[0].body.as_deref(), Some(&br#"{"spans":[]}"#[..]));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let agent = Arc::new(FakeAgent::new());
        let c = communicator(agent, &AgentConfig::default());

        let err = c
            .probe("http://localhost:42699/", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Status { status: 404 });
    }

    #[tokio::test]
    async fn test_probe_returns_server_header() {
        let agent = Arc::new(FakeAgent::healthy("localhost", 42699, 1));
        let c = communicator(agent, &AgentConfig::default());

        let server = c
            .probe("http://localhost:42699/", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(server.as_deref(), Some(crate::config::DEFAULT_SERVER_HEADER));
    }

    #[tokio::test]
    async fn test_exchange_json_decodes_response() {
        let agent = Arc::new(FakeAgent::healthy("localhost", 42699, 99));
        let c = communicator(agent, &AgentConfig::default());

        let response: DiscoveryResponse = c
            .exchange_json(
                Method::PUT,
                "http://localhost:42699/discovery",
                Some(&serde_json::json!({"pid": 1})),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(response.pid, 99);
        assert_eq!(response.agent_uuid, "agent-1");
    }

    #[tokio::test]
    async fn test_malformed_response_is_decode_error() {
        let agent = Arc::new(FakeAgent::new());
        let url = "http://localhost:42699/discovery";
        agent.respond(Method::PUT, url, StatusCode::OK, Vec::new(), "not json");
        let c = communicator(agent, &AgentConfig::default());

        let err = c
            .exchange_json::<(), DiscoveryResponse>(Method::PUT, url, None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Decode(_)));
    }

    #[tokio::test]
    async fn test_failures_while_announced_stay_at_debug() {
        let (logs, _guard) = crate::test_logs::CapturedLogs::install();
        let c = communicator(Arc::new(FakeAgent::new()), &AgentConfig::default());
        announce(&c, "abc");

        let url = c.build_url(crate::protocol::METRICS_PATH);
        assert!(c.probe(&url, Duration::from_millis(100)).await.is_err());

        assert_eq!(logs.count("WARN", "agent request failed"), 0);
        assert_eq!(logs.count("DEBUG", "agent request failed"), 1);
    }

    #[tokio::test]
    async fn test_failures_outside_announced_are_warnings() {
        let (logs, _guard) = crate::test_logs::CapturedLogs::install();
        let c = communicator(Arc::new(FakeAgent::new()), &AgentConfig::default());
        c.context().apply(HandshakeEvent::Init);

        assert!(c
            .probe("http://localhost:42699/", Duration::from_millis(100))
            .await
            .is_err());

        assert_eq!(logs.count("WARN", "agent request failed"), 1);
        assert_eq!(logs.count("DEBUG", "agent request failed"), 0);
    }

    struct StalledTransport;

    impl crate::transport::Transport for StalledTransport {
        async fn execute(&self, _request: AgentRequest) -> Result<AgentResponse, AgentError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_timeout() {
        let context = Arc::new(ConnectivityContext::new("localhost", 42699));
        let c = AgentCommunicator::new(&AgentConfig::default(), context, Arc::new(StalledTransport));

        let err = c
            .probe("http://localhost:42699/", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Timeout(Duration::from_millis(20)));
    }
}
