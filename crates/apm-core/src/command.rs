//! Wire protocol records sent to the collector
//!
//! A request is transmitted as one [`BatchCommand`]: a flat list of
//! [`WireCommand`] records where every container is bracketed by its
//! start and stop records. Consumers rebuild the call tree from that nesting.

use crate::errors::ErrorRecord;
use crate::id::{RequestId, SpanId};
use serde::{Deserialize, Serialize};

/// Tag values are arbitrary JSON
pub type TagValue = serde_json::Value;

/// One record of a command batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireCommand {
    StartRequest {
        request_id: String,
        timestamp: String,
    },
    FinishRequest {
        request_id: String,
        timestamp: Option<String>,
    },
    StartSpan {
        request_id: String,
        span_id: String,
        parent_id: Option<String>,
        operation: String,
        timestamp: String,
    },
    StopSpan {
        request_id: String,
        span_id: String,
        timestamp: Option<String>,
    },
    TagRequest {
        request_id: String,
        tag: String,
        value: TagValue,
    },
    TagSpan {
        request_id: String,
        span_id: String,
        tag: String,
        value: TagValue,
    },
}

/// Ordered records for one completed unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCommand {
    pub commands: Vec<WireCommand>,
}

/// Captured errors for one flush
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBatch {
    pub problems: Vec<ErrorRecord>,
}

/// Anything handed to a [`crate::Sink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    BatchCommand(BatchCommand),
    ErrorBatch(ErrorBatch),
}

impl Payload {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::BatchCommand(_) => "command batch",
            Payload::ErrorBatch(_) => "error batch",
        }
    }

    /// Number of records carried
    pub fn len(&self) -> usize {
        match self {
            Payload::BatchCommand(batch) => batch.commands.len(),
            Payload::ErrorBatch(batch) => batch.problems.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Who a tag is attached to
#[derive(Debug, Clone, PartialEq)]
pub enum TagTarget {
    Request,
    Span(SpanId),
}

/// A name/value annotation on the request or on a span
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: String,
    pub value: TagValue,
    pub request_id: RequestId,
    pub target: TagTarget,
}

impl Tag {
    pub fn for_request(request_id: RequestId, name: impl Into<String>, value: TagValue) -> Self {
        Self {
            name: name.into(),
            value,
            request_id,
            target: TagTarget::Request,
        }
    }

    pub fn for_span(
        request_id: RequestId,
        span_id: SpanId,
        name: impl Into<String>,
        value: TagValue,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            request_id,
            target: TagTarget::Span(span_id),
        }
    }

    pub fn to_wire(&self) -> WireCommand {
        match &self.target {
            TagTarget::Request => WireCommand::TagRequest {
                request_id: self.request_id.to_string(),
                tag: self.name.clone(),
                value: self.value.clone(),
            },
            TagTarget::Span(span_id) => WireCommand::TagSpan {
                request_id: self.request_id.to_string(),
                span_id: span_id.to_string(),
                tag: self.name.clone(),
                value: self.value.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_are_externally_tagged() {
        let record = WireCommand::FinishRequest {
            request_id: "req-1".to_string(),
            timestamp: None,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"FinishRequest": {"request_id": "req-1", "timestamp": null}})
        );
    }

    #[test]
    fn test_batch_envelope_shape() {
        let payload = Payload::BatchCommand(BatchCommand {
            commands: vec![WireCommand::StartRequest {
                request_id: "req-1".to_string(),
                timestamp: "2023-11-14T22:13:20.000000Z".to_string(),
            }],
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value["BatchCommand"]["commands"][0]["StartRequest"]["request_id"],
            "req-1"
        );
        assert_eq!(payload.kind(), "command batch");
        assert_eq!(payload.len(), 1);
    }

    #[test]
    fn test_tag_to_wire() {
        let request_id = RequestId::new();
        let span_id = SpanId::new();

        let request_tag = Tag::for_request(request_id.clone(), "user", json!("alice"));
        assert!(matches!(
            request_tag.to_wire(),
            WireCommand::TagRequest { ref tag, .. } if tag == "user"
        ));

        let span_tag = Tag::for_span(request_id, span_id.clone(), "rows", json!(3));
        match span_tag.to_wire() {
            WireCommand::TagSpan {
                span_id: wire_span,
                value,
                ..
            } => {
                assert_eq!(wire_span, span_id.to_string());
                assert_eq!(value, json!(3));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }
}
