use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// One frame on the hub link.
///
/// `id` is the correlation handle: set on `state`/`query` requests and echoed
/// by the matching `ack`, empty for fire-and-forget traffic. The `payload`
/// field uses `serde_json::value::RawValue` to defer deserialization until the
/// receiver knows which shape to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
}

impl Message {
    /// Builds a message, serializing `payload` eagerly.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
        })
    }

    /// Creates an uncorrelated message.
    pub fn notify<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Message::new(String::new(), msg_type, Some(payload))
    }

    /// Creates the `ack` for a correlated request. `None` is the absent value.
    pub fn ack(id: impl Into<String>, value: Option<&serde_json::Value>) -> Result<Self, serde_json::Error> {
        Message::new(id, MessageType::Ack, value)
    }

    /// Decodes the payload as `T`; `Ok(None)` when there is none.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Returns the payload as a generic value; a JSON `null` counts as absent.
    pub fn value(&self) -> Option<serde_json::Value> {
        match self.parse_payload::<serde_json::Value>() {
            Ok(Some(serde_json::Value::Null)) | Ok(None) | Err(_) => None,
            Ok(Some(v)) => Some(v),
        }
    }

    /// Returns `true` if the sender expects a reply.
    pub fn wants_ack(&self) -> bool {
        self.msg_type.is_request() && !self.id.is_empty()
    }

    /// Creates the reply to this request, preserving its correlation id.
    pub fn reply(&self, value: Option<&serde_json::Value>) -> Result<Self, serde_json::Error> {
        Message::ack(&self.id, value)
    }
}
