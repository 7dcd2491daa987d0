//! Error types for cluster operations.

use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors from the cluster scheduler.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The scheduler refused the workload (quota, admission, invalid spec).
    #[error("workload rejected: {0}")]
    Rejected(String),

    /// An object with the same name already exists.
    #[error("workload {0} already exists")]
    Conflict(String),

    /// The API answered with an unexpected status.
    #[error("cluster API returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or summary.
        message: String,
    },

    /// The API could not be reached.
    #[error("cluster transport error: {0}")]
    Transport(String),

    /// The API answered with something we could not read.
    #[error("invalid cluster response: {0}")]
    InvalidResponse(String),

    /// JSON encoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Whether the scheduler refused the request, as opposed to failing.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(ClusterError::Rejected("quota".into()).is_rejection());
        assert!(ClusterError::Conflict("tb-1".into()).is_rejection());
        assert!(!ClusterError::Transport("refused".into()).is_rejection());
        assert!(!ClusterError::Api {
            status: 500,
            message: "oops".into()
        }
        .is_rejection());
    }

    #[test]
    fn test_error_display() {
        let err = ClusterError::Api {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "cluster API returned 503: unavailable");
    }
}
