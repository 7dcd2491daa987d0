//! Error types for testbed-core.

use crate::sandbox::{SandboxId, SandboxStatus};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for testbed-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors from the manager and the client.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No sandbox with this id is known.
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    /// The operation is not allowed in the sandbox's current status.
    #[error("sandbox {id} is {status}, cannot {operation}")]
    InvalidState {
        id: SandboxId,
        status: SandboxStatus,
        operation: &'static str,
    },

    /// Too many live sandboxes.
    #[error("sandbox limit reached ({0})")]
    LimitReached(usize),

    /// The cluster scheduler refused the workload.
    #[error("provisioning failed for {instance_ref}: {reason}")]
    Provisioning {
        instance_ref: String,
        reason: String,
    },

    /// The sandbox's external endpoint did not become resolvable in time.
    #[error("endpoint for sandbox {id} not resolvable after {waited:?}")]
    EndpointTimeout { id: SandboxId, waited: Duration },

    /// The agent never answered a ping.
    #[error("sandbox {id} did not answer ping within {waited:?}")]
    Connectivity { id: SandboxId, waited: Duration },

    /// The client stopped waiting. The agent may still be working.
    #[error("execution {execution_id} on sandbox {id} not finished after {waited:?}")]
    ExecutionTimeout {
        id: SandboxId,
        execution_id: uuid::Uuid,
        waited: Duration,
    },

    /// The agent rejected the request because it is running something else.
    #[error("sandbox {id} is busy: {reason}")]
    AgentBusy { id: SandboxId, reason: String },

    /// The caller cancelled the wait.
    #[error("operation on sandbox {0} cancelled")]
    Cancelled(SandboxId),

    /// Instance catalog could not be loaded.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request itself makes no sense.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] testbed_cluster::ClusterError),

    #[error("protocol error: {0}")]
    Proto(#[from] testbed_proto::ProtoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the caller can reasonably try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EndpointTimeout { .. }
                | Self::Connectivity { .. }
                | Self::ExecutionTimeout { .. }
                | Self::AgentBusy { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let id = SandboxId::from("demo-testbed-abcde");
        assert!(CoreError::EndpointTimeout {
            id: id.clone(),
            waited: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!CoreError::NotFound(id.clone()).is_retryable());
        assert!(!CoreError::Provisioning {
            instance_ref: "demo".into(),
            reason: "quota".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = CoreError::InvalidState {
            id: SandboxId::from("demo-testbed-abcde"),
            status: SandboxStatus::Deleted,
            operation: "attach a client",
        };
        assert_eq!(
            err.to_string(),
            "sandbox demo-testbed-abcde is deleted, cannot attach a client"
        );
    }
}
