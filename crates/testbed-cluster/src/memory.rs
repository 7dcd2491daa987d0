//! In-memory scheduler.

use crate::cluster::ClusterClient;
use crate::error::{ClusterError, Result};
use crate::workload::{ExposedEndpoint, WorkloadSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// [`ClusterClient`] that only records workloads.
///
/// By default a submitted workload is resolvable right away on
/// `127.0.0.1` with the ports from its spec. Cloning shares state.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    workloads: HashMap<String, FakeWorkload>,
    submissions: usize,
    deletions: usize,
    quota: Option<usize>,
    reject_next: Option<String>,
    ready_after: u32,
    never_ready: bool,
    submit_latency: Duration,
    host: Option<String>,
}

struct FakeWorkload {
    spec: WorkloadSpec,
    lookups: u32,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse submissions once `limit` workloads exist.
    pub fn with_quota(self, limit: usize) -> Self {
        self.lock().quota = Some(limit);
        self
    }

    /// Report workloads resolvable only after `lookups` unsuccessful lookups.
    pub fn with_ready_after(self, lookups: u32) -> Self {
        self.lock().ready_after = lookups;
        self
    }

    /// Never report an endpoint.
    pub fn never_ready(self) -> Self {
        self.lock().never_ready = true;
        self
    }

    /// Sleep this long inside every submission.
    pub fn with_submit_latency(self, latency: Duration) -> Self {
        self.lock().submit_latency = latency;
        self
    }

    /// Host reported for resolved endpoints.
    pub fn with_host(self, host: impl Into<String>) -> Self {
        self.lock().host = Some(host.into());
        self
    }

    /// Reject the next submission with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.lock().reject_next = Some(reason.into());
    }

    /// Submissions accepted so far.
    pub fn submission_count(&self) -> usize {
        self.lock().submissions
    }

    /// Successful deletions so far.
    pub fn deletion_count(&self) -> usize {
        self.lock().deletions
    }

    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().workloads.contains_key(name)
    }

    /// Spec of a live workload.
    pub fn workload(&self, name: &str) -> Option<WorkloadSpec> {
        self.lock().workloads.get(name).map(|w| w.spec.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn submit_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let latency = self.lock().submit_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(reason) = state.reject_next.take() {
            return Err(ClusterError::Rejected(reason));
        }
        if state.workloads.contains_key(&spec.name) {
            return Err(ClusterError::Conflict(spec.name.clone()));
        }
        if let Some(quota) = state.quota {
            if state.workloads.len() >= quota {
                return Err(ClusterError::Rejected(format!(
                    "exceeded quota: {quota} workloads"
                )));
            }
        }
        state.workloads.insert(
            spec.name.clone(),
            FakeWorkload {
                spec: spec.clone(),
                lookups: 0,
            },
        );
        state.submissions += 1;
        tracing::debug!(workload = %spec.name, "Workload recorded");
        Ok(())
    }

    async fn resolve_endpoint(&self, name: &str) -> Result<Option<ExposedEndpoint>> {
        let mut state = self.lock();
        let never_ready = state.never_ready;
        let ready_after = state.ready_after;
        let host = state.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());

        let Some(workload) = state.workloads.get_mut(name) else {
            return Ok(None);
        };
        if never_ready || workload.lookups < ready_after {
            workload.lookups += 1;
            return Ok(None);
        }
        Ok(Some(ExposedEndpoint {
            host,
            publish_port: workload.spec.ports.publish,
            subscribe_port: workload.spec.ports.subscribe,
        }))
    }

    async fn delete_workload(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let existed = state.workloads.remove(name).is_some();
        if existed {
            state.deletions += 1;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadPorts;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: name.into(),
            instance_ref: "inst".into(),
            user_id: None,
            image: "img".into(),
            command: vec![],
            env: BTreeMap::new(),
            ports: WorkloadPorts::default(),
        }
    }

    #[tokio::test]
    async fn test_submit_resolve_delete() {
        let cluster = InMemoryCluster::new();
        cluster.submit_workload(&spec("a")).await.unwrap();
        assert!(cluster.contains("a"));

        let endpoint = cluster.resolve_endpoint("a").await.unwrap().unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.publish_port, 5555);

        assert!(cluster.delete_workload("a").await.unwrap());
        assert!(!cluster.delete_workload("a").await.unwrap());
        assert_eq!(cluster.deletion_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_after_lookups() {
        let cluster = InMemoryCluster::new().with_ready_after(2);
        cluster.submit_workload(&spec("a")).await.unwrap();
        assert!(cluster.resolve_endpoint("a").await.unwrap().is_none());
        assert!(cluster.resolve_endpoint("a").await.unwrap().is_none());
        assert!(cluster.resolve_endpoint("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejections() {
        let cluster = InMemoryCluster::new().with_quota(1);
        cluster.submit_workload(&spec("a")).await.unwrap();

        let err = cluster.submit_workload(&spec("b")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rejected(_)));

        let err = cluster.submit_workload(&spec("a")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));

        cluster.delete_workload("a").await.unwrap();
        cluster.reject_next("admission webhook denied");
        assert!(cluster.submit_workload(&spec("c")).await.is_err());
        cluster.submit_workload(&spec("c")).await.unwrap();
        assert_eq!(cluster.submission_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_workload_not_resolvable() {
        let cluster = InMemoryCluster::new();
        assert!(cluster.resolve_endpoint("ghost").await.unwrap().is_none());
    }
}
