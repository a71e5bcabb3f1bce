//! The span shape sent to the agent.
//!
//! The tracer's own span model lives elsewhere and converts into [`Span`] when
//! a span finishes; this type only carries what enrichment and transmission
//! read or write.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// A finished span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: u128,
    pub span_id: u64,
    /// 0 for a root span.
    pub parent_span_id: u64,
    /// Unix nanoseconds.
    pub start_time: u64,
    /// Unix nanoseconds.
    pub end_time: u64,
    pub name: String,
    /// Boxed so entries parked in the deferred buffer stay small.
    pub attributes: Box<HashMap<String, AttributeValue>>,
    pub status: SpanStatus,
    pub kind: SpanKind,
}

/// Attribute values as the agent accepts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// Role of the span in its trace. Deferred enrichment targets `Server` spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
}

/// Spans sent to the agent in one request; encodes as a bare JSON array.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct SpanBatch {
    pub spans: Vec<Span>,
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

impl Span {
    /// A span that starts (and, until [`finish`](Self::finish), ends) now.
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: u64,
        name: String,
        kind: SpanKind,
    ) -> Self {
        let now = unix_nanos();
        Self {
            trace_id,
            span_id,
            parent_span_id,
            start_time: now,
            end_time: now,
            name,
            attributes: Box::default(),
            status: SpanStatus::Unset,
            kind,
        }
    }

    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos();
        self.status = status;
    }

    /// Sets `key`, replacing any earlier value.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

impl SpanBatch {
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_encodes_as_array() {
        let mut span = Span::new(1, 2, 0, "GET /".into(), SpanKind::Server);
        span.set_attribute("http.status_code", 200i64);
        span.set_attribute("cached", false);

        let json = serde_json::to_value(SpanBatch::with_spans(vec![span])).unwrap();

        let spans = json.as_array().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0]["attributes"]["http.status_code"], 200);
        assert_eq!(spans[0]["attributes"]["cached"], false);
        assert_eq!(spans[0]["kind"], "Server");
    }

    #[test]
    fn test_finish_sets_status_and_end() {
        let mut span = Span::new(1, 2, 0, "work".into(), SpanKind::Internal);
        assert_eq!(span.status, SpanStatus::Unset);

        span.finish(SpanStatus::Error);
        assert_eq!(span.status, SpanStatus::Error);
        assert!(span.end_time >= span.start_time);
    }

    #[test]
    fn test_set_attribute_replaces() {
        let mut span = Span::new(1, 2, 0, "work".into(), SpanKind::Internal);
        span.set_attribute("user", "a");
        span.set_attribute("user", "b");
        assert_eq!(span.attribute("user"), Some(&AttributeValue::from("b")));
        assert_eq!(span.attribute("missing"), None);
    }
}
