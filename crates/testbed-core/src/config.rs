//! Manager and client configuration.

use crate::error::CoreError;
use std::time::Duration;
use testbed_cluster::WorkloadPorts;

/// Placeholder replaced by the instance reference in image templates.
pub const INSTANCE_PLACEHOLDER: &str = "{instance_id}";

/// Timing of the client's polling loops.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Cadence of status polling (default: 1s).
    pub poll_interval: Duration,
    /// Resend a request when no status for it arrived for this long (default: 5s).
    pub resend_after: Duration,
    /// Upper bound for applying a patch (default: 120s).
    pub patch_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            resend_after: Duration::from_secs(5),
            patch_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resend_after(mut self, after: Duration) -> Self {
        self.resend_after = after;
        self
    }

    pub fn with_patch_timeout(mut self, timeout: Duration) -> Self {
        self.patch_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.poll_interval.is_zero() {
            return Err(CoreError::Config("poll_interval must be > 0".into()));
        }
        if self.resend_after < self.poll_interval {
            return Err(CoreError::Config(
                "resend_after must be at least poll_interval".into(),
            ));
        }
        if self.patch_timeout.is_zero() {
            return Err(CoreError::Config("patch_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the sandbox manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Image reference with an `{instance_id}` placeholder.
    pub image_template: String,
    /// Entrypoint of the workload container.
    pub agent_command: Vec<String>,
    /// Ports the agent listens on inside the workload.
    pub ports: WorkloadPorts,
    /// Maximum number of live sandboxes (default: 100).
    pub max_sandboxes: usize,
    /// Destroyed sandboxes still answered as `Deleted`, newest kept
    /// (default: 1000).
    pub retain_deleted: usize,
    /// Cadence of endpoint lookups in `create_client` (default: 1s).
    pub endpoint_poll_interval: Duration,
    /// Settings handed to every client.
    pub client: ClientConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            image_template: "testbeds/sweb.eval.x86_64.{instance_id}:latest".to_string(),
            agent_command: vec!["testbed-agent".to_string()],
            ports: WorkloadPorts::default(),
            max_sandboxes: 100,
            retain_deleted: 1000,
            endpoint_poll_interval: Duration::from_secs(1),
            client: ClientConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_image_template(mut self, template: impl Into<String>) -> Self {
        self.image_template = template.into();
        self
    }

    pub fn with_agent_command(mut self, command: Vec<String>) -> Self {
        self.agent_command = command;
        self
    }

    pub fn with_ports(mut self, ports: WorkloadPorts) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_max_sandboxes(mut self, max: usize) -> Self {
        self.max_sandboxes = max;
        self
    }

    pub fn with_retain_deleted(mut self, count: usize) -> Self {
        self.retain_deleted = count;
        self
    }

    pub fn with_endpoint_poll_interval(mut self, interval: Duration) -> Self {
        self.endpoint_poll_interval = interval;
        self
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// Image for one instance.
    pub fn image_for(&self, instance_ref: &str) -> String {
        self.image_template
            .replace(INSTANCE_PLACEHOLDER, &instance_ref.to_lowercase())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image_template.trim().is_empty() {
            return Err(CoreError::Config("image_template is required".into()));
        }
        if self.max_sandboxes == 0 {
            return Err(CoreError::Config("max_sandboxes must be > 0".into()));
        }
        if self.endpoint_poll_interval.is_zero() {
            return Err(CoreError::Config(
                "endpoint_poll_interval must be > 0".into(),
            ));
        }
        let ports = self.ports;
        if ports.publish == ports.subscribe
            || ports.http == ports.publish
            || ports.http == ports.subscribe
        {
            return Err(CoreError::Config("workload ports must differ".into()));
        }
        if !self.image_template.contains(INSTANCE_PLACEHOLDER) {
            tracing::warn!(
                template = %self.image_template,
                "Image template has no {{instance_id}} placeholder, every sandbox uses the same image"
            );
        }
        self.client.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ManagerConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn test_image_for_substitutes_instance() {
        let config = ManagerConfig::default().with_image_template("registry/{instance_id}:v1");
        assert_eq!(
            config.image_for("Django__django-11099"),
            "registry/django__django-11099:v1"
        );
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let err = ManagerConfig::default()
            .with_max_sandboxes(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let ports = WorkloadPorts {
            publish: 5555,
            subscribe: 5555,
            http: 8000,
        };
        assert!(ManagerConfig::default().with_ports(ports).validate().is_err());
    }

    #[test]
    fn test_client_resend_shorter_than_poll_is_invalid() {
        let config = ClientConfig::default()
            .with_poll_interval(Duration::from_secs(2))
            .with_resend_after(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }
}
