//! Workload descriptions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the workload name.
pub const LABEL_TESTBED_ID: &str = "testbed-id";
/// Label carrying the instance reference.
pub const LABEL_INSTANCE_ID: &str = "instance-id";
/// Label carrying the requesting user.
pub const LABEL_USER_ID: &str = "user-id";

/// Ports exposed by every testbed workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadPorts {
    /// Agent publish channel.
    pub publish: u16,
    /// Agent subscribe channel.
    pub subscribe: u16,
    /// Sidecar HTTP surface.
    pub http: u16,
}

impl Default for WorkloadPorts {
    fn default() -> Self {
        Self {
            publish: 5555,
            subscribe: 5556,
            http: 8000,
        }
    }
}

/// Everything needed to start one sandbox workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Object name, also the sandbox id.
    pub name: String,
    pub instance_ref: String,
    pub user_id: Option<String>,
    /// Container image with the checkout and the agent binary.
    pub image: String,
    /// Entrypoint running the agent.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: WorkloadPorts,
}

impl WorkloadSpec {
    /// Labels identifying the workload and its owner.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_TESTBED_ID.to_string(), sanitize_label(&self.name));
        labels.insert(
            LABEL_INSTANCE_ID.to_string(),
            sanitize_label(&self.instance_ref),
        );
        if let Some(user) = &self.user_id {
            labels.insert(LABEL_USER_ID.to_string(), sanitize_label(user));
        }
        labels
    }
}

/// Where a workload can be reached from outside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedEndpoint {
    pub host: String,
    pub publish_port: u16,
    pub subscribe_port: u16,
}

/// Make `value` acceptable as a Kubernetes label value: at most 63
/// characters of `[A-Za-z0-9._-]`, starting and ending alphanumeric.
pub fn sanitize_label(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(user: Option<&str>) -> WorkloadSpec {
        WorkloadSpec {
            name: "django-django-11099-testbed-a1b2c".into(),
            instance_ref: "django__django-11099".into(),
            user_id: user.map(String::from),
            image: "img".into(),
            command: vec![],
            env: BTreeMap::new(),
            ports: WorkloadPorts::default(),
        }
    }

    #[test]
    fn test_labels_include_user_when_present() {
        let labels = spec(Some("alice@example.com")).labels();
        assert_eq!(labels[LABEL_INSTANCE_ID], "django__django-11099");
        assert_eq!(labels[LABEL_USER_ID], "alice-example.com");
        assert!(!spec(None).labels().contains_key(LABEL_USER_ID));
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("--a b--"), "a-b");
        assert_eq!(sanitize_label(&"x".repeat(80)).len(), 63);
        assert_eq!(sanitize_label("ok.value_1"), "ok.value_1");
    }
}
