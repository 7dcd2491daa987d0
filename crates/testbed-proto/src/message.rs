//! The wire envelope.

use crate::error::{ProtoError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Type tag carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Liveness check sent by the client.
    Ping,
    /// Reply to a ping, echoing its payload.
    Pong,
    /// Run a shell command.
    ExecRequest,
    /// Apply a unified diff to the checkout.
    ApplyPatch,
    /// Run the sandbox's evaluation script.
    RunEvaluation,
    /// Progress or final state of an execution.
    ExecStatus,
    /// Final record of an evaluation.
    Result,
    /// The agent could not handle a message.
    Error,
    /// A tag this build does not know about.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ExecRequest => "exec_request",
            Self::ApplyPatch => "apply_patch",
            Self::RunEvaluation => "run_evaluation",
            Self::ExecStatus => "exec_status",
            Self::Result => "result",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One envelope on the wire.
///
/// Fields are private so a message cannot change after it is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    owner_id: String,
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(default)]
    payload: Value,
    sent_at: DateTime<Utc>,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(owner_id: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self {
            owner_id: owner_id.into(),
            message_type,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Build a message from any serializable payload.
    pub fn with_payload<T: Serialize>(
        owner_id: impl Into<String>,
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::new(owner_id, message_type, serde_json::to_value(payload)?))
    }

    /// Sandbox id of the sender.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// Decode the payload into a typed struct.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(|e| ProtoError::UnexpectedPayload {
            message_type: self.message_type.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tags_use_snake_case() {
        let message = Message::new("tb-1", MessageType::ExecRequest, json!({}));
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["type"], "exec_request");
        assert_eq!(encoded["owner_id"], "tb-1");
    }

    #[test]
    fn test_unknown_tag_decodes() {
        let raw = json!({
            "owner_id": "tb-1",
            "type": "file_upload",
            "payload": {"a": 1},
            "sent_at": "2024-01-01T00:00:00Z"
        });
        let message: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(message.message_type(), MessageType::Unknown);
        assert_eq!(message.payload()["a"], 1);
    }

    #[test]
    fn test_parse_payload_reports_type() {
        #[derive(Debug, Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            nonce: u64,
        }

        let message = Message::new("tb-1", MessageType::Ping, json!({"other": true}));
        let err = message.parse_payload::<Needs>().unwrap_err();
        assert!(err.to_string().contains("ping"));
    }
}
