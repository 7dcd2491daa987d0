//! Typed payloads for the request messages.
//!
//! `exec_status` and `result` carry an [`ExecutionRecord`](crate::ExecutionRecord)
//! directly.

use crate::message::MessageType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of `ping`, echoed back unchanged in `pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: Uuid,
}

impl Ping {
    pub fn new() -> Self {
        Self {
            nonce: Uuid::new_v4(),
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of `exec_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub execution_id: Uuid,
    /// Passed to `sh -c`.
    pub command: String,
    /// Agent-side limit. The agent default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Payload of `apply_patch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyPatchRequest {
    pub execution_id: Uuid,
    /// Unified diff, relative to the checkout root.
    pub patch: String,
}

/// Payload of `run_evaluation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvaluationRequest {
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageType>,
}
