//! # testbed-cluster
//!
//! The slice of a cluster scheduler that testbed orchestration needs:
//! submit a workload, resolve its external endpoint, delete it.
//!
//! Two implementations are provided:
//!
//! - [`KubeProxyCluster`] creates a Kubernetes Job plus Service per workload,
//!   talking to the API server through `kubectl proxy`.
//! - [`InMemoryCluster`] keeps everything in memory, with knobs for
//!   readiness delays, quota and rejections.

mod cluster;
mod error;
mod kube;
pub mod manifest;
mod memory;
mod workload;

pub use cluster::ClusterClient;
pub use error::{ClusterError, Result};
pub use kube::{KubeProxyCluster, DEFAULT_PROXY_URL, DEFAULT_REQUEST_TIMEOUT};
pub use memory::InMemoryCluster;
pub use workload::{sanitize_label, ExposedEndpoint, WorkloadPorts, WorkloadSpec};
