//! Mapping manager and client errors onto HTTP responses.

use crate::types::ErrorBody;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use testbed_core::CoreError;

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidState { .. } | CoreError::AgentBusy { .. } => StatusCode::CONFLICT,
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::LimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Provisioning { .. } => StatusCode::BAD_GATEWAY,
            CoreError::Connectivity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::EndpointTimeout { .. } | CoreError::ExecutionTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidState { .. } => "invalid_state",
            CoreError::AgentBusy { .. } => "busy",
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::LimitReached(_) => "limit_reached",
            CoreError::Provisioning { .. } => "provisioning",
            CoreError::Connectivity { .. } => "connectivity",
            CoreError::EndpointTimeout { .. } => "endpoint_timeout",
            CoreError::ExecutionTimeout { .. } => "execution_timeout",
            CoreError::Cancelled(_) => "cancelled",
            _ => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, %status, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use testbed_core::{SandboxId, SandboxStatus};

    fn status_of(error: CoreError) -> StatusCode {
        ApiError(error).status()
    }

    #[test]
    fn test_status_mapping() {
        let id = SandboxId::from("x-testbed-aaaaa");
        assert_eq!(status_of(CoreError::NotFound(id.clone())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(CoreError::InvalidState {
                id: id.clone(),
                status: SandboxStatus::InUse,
                operation: "attach a client",
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(CoreError::LimitReached(3)), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_of(CoreError::Provisioning {
                instance_ref: "x".into(),
                reason: "quota".into(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(CoreError::Connectivity {
                id: id.clone(),
                waited: Duration::from_secs(1),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(CoreError::EndpointTimeout {
                id,
                waited: Duration::from_secs(1),
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(CoreError::Catalog("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
