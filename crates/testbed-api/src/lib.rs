//! # testbed-api
//!
//! HTTP front end for the sandbox manager. Clients create a testbed for an
//! instance, run test files against a patch in it, and destroy it.
//!
//! ```text
//! caller ──REST──▶ testbed-api ──▶ SandboxManager ──▶ cluster
//!                                        │
//!                                        └──tcp──▶ testbed-agent
//! ```

pub mod config;
mod error;
pub mod http;
pub mod types;

pub use config::{ApiConfig, ClusterBackend, ConfigError};
pub use error::ApiError;
pub use http::{build_router, AppState};
