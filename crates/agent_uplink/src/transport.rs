//! HTTP transport seam between the communicator and the network.
//!
//! [`Transport`] uses native async fn in traits; [`TransportBoxed`] is the
//! object-safe twin the communicator stores, with a blanket impl so any
//! `Transport` can be handed over as `Arc<dyn TransportBoxed>`.

use crate::error::AgentError;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// One request to the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// The agent's answer, body fully read.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AgentResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Performs HTTP requests against the agent.
///
/// Implementations report the outcome of the exchange only; status
/// classification happens in the communicator.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: AgentRequest,
    ) -> impl Future<Output = Result<AgentResponse, AgentError>> + Send;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn execute_boxed(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: Transport> TransportBoxed for T {
    fn execute_boxed(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + '_>> {
        Box::pin(self.execute(request))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Production transport over a pooled `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let timeout = request.timeout;
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(timeout);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(&e, timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::from_reqwest(&e, timeout))?;

        Ok(AgentResponse {
            status,
            headers,
            body,
        })
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}
