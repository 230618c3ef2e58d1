//! Payload shapes for each [`MessageType`](crate::MessageType).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Agent → hub `state` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRequest {
    pub target_name: String,
    pub key: String,
}

/// Agent → hub `query` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub target_name: String,
    pub key: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Hub → target `query` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedQuery {
    pub key: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl From<QueryRequest> for ForwardedQuery {
    fn from(req: QueryRequest) -> Self {
        Self {
            key: req.key,
            params: req.params,
        }
    }
}

/// Agent → hub `log` payload: the message merged with caller-supplied fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub raw: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogRecord {
    /// Builds a record; `raw` wins over an `extra` field of the same name.
    pub fn new(raw: impl Into<String>, mut extra: Map<String, Value>) -> Self {
        extra.remove("raw");
        Self {
            raw: raw.into(),
            extra,
        }
    }
}

/// Hub → audience `log` payload, tagged with the originating agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBroadcast {
    pub name: String,
    pub data: Value,
}

impl LogBroadcast {
    /// Returns the `raw` text of the relayed record, if it has one.
    pub fn raw(&self) -> Option<&str> {
        self.data.get("raw").and_then(Value::as_str)
    }
}

/// Agent → hub `event` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Hub → subscriber `event` payload. `source` is the publishing agent, which
/// is also the group the event was multicast to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedEvent {
    pub source: String,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RelayedEvent {
    pub fn from_envelope(source: impl Into<String>, envelope: EventEnvelope) -> Self {
        Self {
            source: source.into(),
            event: envelope.event,
            args: envelope.args,
        }
    }
}
