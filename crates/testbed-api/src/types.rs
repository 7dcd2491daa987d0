//! Request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testbed_core::{SandboxInfo, SandboxStatus};

// ============================================================================
// Testbed Lifecycle
// ============================================================================

/// Body of `POST /testbeds`.
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTestbedRequest {
    /// Instance to provision, e.g. `django__django-11099`.
    pub instance_id: String,
}

/// Endpoints of a testbed's agent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestbedEndpoints {
    pub publish: String,
    pub subscribe: String,
}

/// A testbed as reported by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct TestbedSummary {
    pub testbed_id: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: SandboxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<TestbedEndpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<SandboxInfo> for TestbedSummary {
    fn from(info: SandboxInfo) -> Self {
        Self {
            testbed_id: info.id.to_string(),
            instance_id: info.instance_ref,
            user_id: info.user_id,
            status: info.status,
            endpoints: info.endpoints.map(|pair| TestbedEndpoints {
                publish: pair.publish,
                subscribe: pair.subscribe,
            }),
            error: info.error,
            created_at: info.created_at,
        }
    }
}

/// Body of `GET /testbeds`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListTestbedsResponse {
    pub testbeds: Vec<TestbedSummary>,
}

/// Body returned by the delete endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

// ============================================================================
// Test Runs
// ============================================================================

/// Body of `POST /testbeds/:id/run-tests`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RunTestsRequest {
    pub test_files: Vec<String>,
    /// Unified diff applied before the run.
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Body of `POST /testbeds/:id/run-evaluation`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RunEvaluationRequest {
    /// Patch to evaluate. The instance's gold patch when absent.
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Machine-readable error class.
    pub kind: String,
}
