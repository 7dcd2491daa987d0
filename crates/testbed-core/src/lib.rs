//! # testbed-core
//!
//! Orchestration layer for testbeds: short-lived sandboxes in which a patch
//! is applied and tests are run.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       testbed-core                       │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxManager  │────▶│  ClusterClient           │    │
//! │  │  - create()     │     │  (from testbed-cluster)  │    │
//! │  │  - destroy()    │     └──────────────────────────┘    │
//! │  │  - create_client│                                     │
//! │  └─────────────────┘                                     │
//! │           │ binds                                        │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  TestbedClient  │────▶│  Communicator            │    │
//! │  │  - ping()       │     │  (from testbed-proto)    │    │
//! │  │  - exec()       │     └──────────────────────────┘    │
//! │  │  - run_tests()  │                  │ tcp             │
//! │  └─────────────────┘                  ▼                  │
//! │           │ grades with  ┌──────────────────────────┐    │
//! │           └─────────────▶│  eval: parsers, reports  │    │
//! │                          └──────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │             testbed-agent (inside the sandbox)           │
//! │            publish :5555        subscribe :5556          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use testbed_cluster::KubeProxyCluster;
//! use testbed_core::{ManagerConfig, SandboxManager, StaticCatalog};
//!
//! # async fn example() -> testbed_core::Result<()> {
//! let cluster = KubeProxyCluster::new("http://127.0.0.1:8001", "testbeds");
//! let catalog = StaticCatalog::from_json_file("instances.json")?;
//! let manager = SandboxManager::new(Arc::new(cluster), Arc::new(catalog), ManagerConfig::default())?;
//!
//! let id = manager.create("django__django-11099", None).await?;
//! let mut client = manager.create_client(&id, Duration::from_secs(300)).await?;
//! client.wait_until_ready(Duration::from_secs(30)).await?;
//!
//! let files = vec!["tests/auth_tests/test_validators.py".to_string()];
//! let result = client.run_tests(&files, Some(PATCH), Duration::from_secs(600)).await?;
//! println!("{:?}: {} regressions", result.status, result.regressions().len());
//!
//! manager.destroy(&id).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
pub mod eval;
mod manager;
mod sandbox;

pub use client::TestbedClient;
pub use config::{ClientConfig, ManagerConfig, INSTANCE_PLACEHOLDER};
pub use error::{CoreError, Result};
pub use eval::{
    EvaluationResult, InstanceCatalog, ResolvedStatus, RunStatus, StaticCatalog, TestOutcome,
    TestResult, TestSpec, TestStatus,
};
pub use manager::SandboxManager;
pub use sandbox::{SandboxId, SandboxInfo, SandboxStatus};
