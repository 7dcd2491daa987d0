use crate::error::Result;
use crate::workload::{ExposedEndpoint, WorkloadSpec};
use async_trait::async_trait;

/// Scheduler operations the manager depends on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the workload and the service exposing its ports.
    ///
    /// Quota exhaustion and name collisions are reported as
    /// [`ClusterError::Rejected`](crate::ClusterError::Rejected) or
    /// [`ClusterError::Conflict`](crate::ClusterError::Conflict).
    async fn submit_workload(&self, spec: &WorkloadSpec) -> Result<()>;

    /// External endpoint of the workload, or `None` while not yet reachable.
    async fn resolve_endpoint(&self, name: &str) -> Result<Option<ExposedEndpoint>>;

    /// Delete the workload and its service. Returns `false` when nothing
    /// existed under `name`.
    async fn delete_workload(&self, name: &str) -> Result<bool>;
}
