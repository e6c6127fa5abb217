use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// One wire message.
///
/// `correlationId` is `null` for one-way events; a request and its response
/// share the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub correlation_id: Option<u64>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn event(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: None,
            payload,
            error: None,
        }
    }

    pub fn request(event_type: impl Into<String>, correlation_id: u64, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: Some(correlation_id),
            payload,
            error: None,
        }
    }

    pub fn encode(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Protocol(format!("encode failed: {}", e)))
    }

    pub fn decode(text: &str) -> Result<Self, BridgeError> {
        let envelope: Self = serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("malformed envelope: {}", e)))?;
        if envelope.event_type.is_empty() {
            return Err(BridgeError::Protocol("envelope without a type".to_string()));
        }
        Ok(envelope)
    }
}
