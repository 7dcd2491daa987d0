//! Configuration for the API server.
//!
//! Configuration is loaded from environment variables with defaults.
//! Unparsable values fall back to the default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testbed_cluster::{ClusterClient, InMemoryCluster, KubeProxyCluster, DEFAULT_PROXY_URL};
use testbed_core::{ManagerConfig, SandboxManager, StaticCatalog};

/// Where workloads are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterBackend {
    /// Kubernetes through an API proxy.
    #[default]
    Kube,
    /// In-process fake, for local development.
    Memory,
}

impl ClusterBackend {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "mem" | "fake" => Self::Memory,
            _ => Self::Kube,
        }
    }
}

/// Configuration for the testbed API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    pub cluster: ClusterBackend,

    /// Base URL of the Kubernetes API proxy.
    pub kube_proxy_url: String,

    /// Namespace workloads are created in.
    pub namespace: String,

    /// Resolve endpoints through service DNS instead of the load balancer.
    pub in_cluster: bool,

    /// JSON file of instance test specs. Empty catalog when unset.
    pub catalog_path: Option<PathBuf>,

    pub image_template: String,

    pub max_sandboxes: usize,

    /// How long a request waits for a testbed's endpoint and agent.
    pub client_timeout: Duration,

    /// Run timeout when a request does not carry its own.
    pub run_timeout: Duration,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("catalog file not found: {0}")]
    MissingCatalog(PathBuf),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid kube proxy url: {0}")]
    InvalidProxyUrl(String),
}

impl Default for ApiConfig {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            cluster: ClusterBackend::Kube,
            kube_proxy_url: DEFAULT_PROXY_URL.to_string(),
            namespace: "testbeds".to_string(),
            in_cluster: false,
            catalog_path: None,
            image_template: manager.image_template,
            max_sandboxes: manager.max_sandboxes,
            client_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(1800),
        }
    }
}

impl ApiConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TESTBED_API_HOST` | `0.0.0.0` |
    /// | `TESTBED_API_PORT` | `8080` |
    /// | `TESTBED_CLUSTER` | `kube` (kube, memory) |
    /// | `TESTBED_KUBE_PROXY_URL` | `http://127.0.0.1:8001` |
    /// | `TESTBED_NAMESPACE` | `testbeds` |
    /// | `TESTBED_IN_CLUSTER` | `false` |
    /// | `TESTBED_CATALOG` | unset |
    /// | `TESTBED_IMAGE_TEMPLATE` | `testbeds/sweb.eval.x86_64.{instance_id}:latest` |
    /// | `TESTBED_MAX_SANDBOXES` | `100` |
    /// | `TESTBED_CLIENT_TIMEOUT_SECS` | `300` |
    /// | `TESTBED_RUN_TIMEOUT_SECS` | `1800` |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let host: IpAddr = lookup("TESTBED_API_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());
        let port: u16 = lookup("TESTBED_API_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());
        let secs = |name: &str, fallback: Duration| {
            lookup(name)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            http_addr: SocketAddr::new(host, port),
            cluster: lookup("TESTBED_CLUSTER")
                .map(|v| ClusterBackend::parse(&v))
                .unwrap_or(default.cluster),
            kube_proxy_url: lookup("TESTBED_KUBE_PROXY_URL").unwrap_or(default.kube_proxy_url),
            namespace: lookup("TESTBED_NAMESPACE").unwrap_or(default.namespace),
            in_cluster: lookup("TESTBED_IN_CLUSTER")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(default.in_cluster),
            catalog_path: lookup("TESTBED_CATALOG")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            image_template: lookup("TESTBED_IMAGE_TEMPLATE").unwrap_or(default.image_template),
            max_sandboxes: lookup("TESTBED_MAX_SANDBOXES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_sandboxes),
            client_timeout: secs("TESTBED_CLIENT_TIMEOUT_SECS", default.client_timeout),
            run_timeout: secs("TESTBED_RUN_TIMEOUT_SECS", default.run_timeout),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.catalog_path {
            if !path.exists() {
                return Err(ConfigError::MissingCatalog(path.clone()));
            }
        }
        if self.max_sandboxes == 0 {
            return Err(ConfigError::Zero("TESTBED_MAX_SANDBOXES"));
        }
        if self.client_timeout.is_zero() {
            return Err(ConfigError::Zero("TESTBED_CLIENT_TIMEOUT_SECS"));
        }
        if self.run_timeout.is_zero() {
            return Err(ConfigError::Zero("TESTBED_RUN_TIMEOUT_SECS"));
        }
        if self.cluster == ClusterBackend::Kube
            && !(self.kube_proxy_url.starts_with("http://")
                || self.kube_proxy_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidProxyUrl(self.kube_proxy_url.clone()));
        }
        Ok(())
    }

    /// Log warnings for configuration problems without failing.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration validation warning");
        }
    }

    /// Build the sandbox manager this configuration describes.
    pub fn build_manager(&self) -> testbed_core::Result<SandboxManager> {
        let cluster: Arc<dyn ClusterClient> = match self.cluster {
            ClusterBackend::Kube => Arc::new(
                KubeProxyCluster::new(self.kube_proxy_url.clone(), self.namespace.clone())
                    .in_cluster(self.in_cluster),
            ),
            ClusterBackend::Memory => Arc::new(InMemoryCluster::new()),
        };

        let catalog = match &self.catalog_path {
            Some(path) => StaticCatalog::from_json_file(path)?,
            None => StaticCatalog::new(),
        };
        tracing::info!(instances = catalog.len(), "Instance catalog loaded");

        let config = ManagerConfig::default()
            .with_image_template(self.image_template.clone())
            .with_max_sandboxes(self.max_sandboxes);
        SandboxManager::new(cluster, Arc::new(catalog), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_cluster_backend_parse() {
        assert_eq!(ClusterBackend::parse("memory"), ClusterBackend::Memory);
        assert_eq!(ClusterBackend::parse("MEM"), ClusterBackend::Memory);
        assert_eq!(ClusterBackend::parse("kube"), ClusterBackend::Kube);
        assert_eq!(ClusterBackend::parse("unknown"), ClusterBackend::Kube);
    }

    #[test]
    fn test_default_config() {
        let config = ApiConfig::from_lookup(lookup(&[]));
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.cluster, ClusterBackend::Kube);
        assert_eq!(config.kube_proxy_url, "http://127.0.0.1:8001");
        assert_eq!(config.namespace, "testbeds");
        assert!(config.catalog_path.is_none());
        assert_eq!(config.max_sandboxes, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("TESTBED_API_PORT", "9090"),
            ("TESTBED_CLUSTER", "memory"),
            ("TESTBED_IN_CLUSTER", "true"),
            ("TESTBED_MAX_SANDBOXES", "not-a-number"),
            ("TESTBED_CLIENT_TIMEOUT_SECS", "12"),
        ]));
        assert_eq!(config.http_addr.port(), 9090);
        assert_eq!(config.cluster, ClusterBackend::Memory);
        assert!(config.in_cluster);
        assert_eq!(config.max_sandboxes, 100);
        assert_eq!(config.client_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_validate_rejects_missing_catalog() {
        let config = ApiConfig {
            catalog_path: Some(PathBuf::from("/nonexistent/instances.json")),
            ..ApiConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCatalog(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let config = ApiConfig {
            max_sandboxes: 0,
            ..ApiConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn test_build_manager_in_memory() {
        let config = ApiConfig {
            cluster: ClusterBackend::Memory,
            max_sandboxes: 7,
            ..ApiConfig::default()
        };
        let manager = config.build_manager().unwrap();
        assert_eq!(manager.config().max_sandboxes, 7);
    }
}
