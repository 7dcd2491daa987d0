//! Agent configuration.
//!
//! Loaded from environment variables with defaults matching the workload
//! manifests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use testbed_proto::{DEFAULT_PUBLISH_PORT, DEFAULT_SUBSCRIBE_PORT};

/// Default port of the sidecar HTTP surface.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Configuration for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Sandbox id. Messages stamped with any other id are ignored.
    pub testbed_id: String,

    /// Where `pong`, `exec_status` and `result` are published.
    pub publish_addr: SocketAddr,

    /// Where requests are received.
    pub subscribe_addr: SocketAddr,

    /// Sidecar HTTP surface, `None` to disable it.
    pub http_addr: Option<SocketAddr>,

    /// Checkout the commands run in.
    pub workdir: PathBuf,

    /// Script run for `run_evaluation`.
    pub eval_script: PathBuf,

    /// Limit for executions that do not carry their own.
    pub exec_timeout: Duration,

    /// Finished records kept for duplicate requests.
    pub history_limit: usize,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("port {0} is used by more than one listener")]
    PortClash(u16),
}

impl AgentConfig {
    pub fn new(testbed_id: impl Into<String>) -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            testbed_id: testbed_id.into(),
            publish_addr: SocketAddr::new(any, DEFAULT_PUBLISH_PORT),
            subscribe_addr: SocketAddr::new(any, DEFAULT_SUBSCRIBE_PORT),
            http_addr: Some(SocketAddr::new(any, DEFAULT_HTTP_PORT)),
            workdir: PathBuf::from("/testbed"),
            eval_script: PathBuf::from("/eval.sh"),
            exec_timeout: Duration::from_secs(1800),
            history_limit: 32,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TESTBED_ID` | required |
    /// | `TESTBED_PUBLISH_ADDR` | `0.0.0.0:5555` |
    /// | `TESTBED_SUBSCRIBE_ADDR` | `0.0.0.0:5556` |
    /// | `TESTBED_HTTP_ADDR` | `0.0.0.0:8000` (`off` disables) |
    /// | `TESTBED_WORKDIR` | `/testbed` |
    /// | `TESTBED_EVAL_SCRIPT` | `/eval.sh` |
    /// | `TESTBED_EXEC_TIMEOUT_SECS` | `1800` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let testbed_id = lookup("TESTBED_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("TESTBED_ID"))?;
        let mut config = Self::new(testbed_id);

        if let Some(value) = lookup("TESTBED_PUBLISH_ADDR") {
            config.publish_addr = parse("TESTBED_PUBLISH_ADDR", &value)?;
        }
        if let Some(value) = lookup("TESTBED_SUBSCRIBE_ADDR") {
            config.subscribe_addr = parse("TESTBED_SUBSCRIBE_ADDR", &value)?;
        }
        if let Some(value) = lookup("TESTBED_HTTP_ADDR") {
            config.http_addr = match value.to_lowercase().as_str() {
                "" | "off" | "none" => None,
                _ => Some(parse("TESTBED_HTTP_ADDR", &value)?),
            };
        }
        if let Some(value) = lookup("TESTBED_WORKDIR") {
            config.workdir = PathBuf::from(value);
        }
        if let Some(value) = lookup("TESTBED_EVAL_SCRIPT") {
            config.eval_script = PathBuf::from(value);
        }
        if let Some(value) = lookup("TESTBED_EXEC_TIMEOUT_SECS") {
            let secs: u64 = parse("TESTBED_EXEC_TIMEOUT_SECS", &value)?;
            config.exec_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the three listeners do not share a port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let publish = self.publish_addr.port();
        let subscribe = self.subscribe_addr.port();
        if publish != 0 && publish == subscribe {
            return Err(ConfigError::PortClash(publish));
        }
        if let Some(http) = self.http_addr.map(|a| a.port()) {
            if http != 0 && (http == publish || http == subscribe) {
                return Err(ConfigError::PortClash(http));
            }
        }
        if self.exec_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "TESTBED_EXEC_TIMEOUT_SECS",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
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
    fn test_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[("TESTBED_ID", "tb-1")])).unwrap();
        assert_eq!(config.testbed_id, "tb-1");
        assert_eq!(config.publish_addr.port(), 5555);
        assert_eq!(config.subscribe_addr.port(), 5556);
        assert_eq!(config.http_addr.map(|a| a.port()), Some(8000));
        assert_eq!(config.workdir, PathBuf::from("/testbed"));
        assert_eq!(config.exec_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_missing_id() {
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("TESTBED_ID"))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("TESTBED_ID", "tb-2"),
            ("TESTBED_PUBLISH_ADDR", "127.0.0.1:6000"),
            ("TESTBED_HTTP_ADDR", "off"),
            ("TESTBED_EXEC_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.publish_addr.port(), 6000);
        assert!(config.http_addr.is_none());
        assert_eq!(config.exec_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_http_port_must_not_clash() {
        let err = AgentConfig::from_lookup(lookup(&[
            ("TESTBED_ID", "tb-3"),
            ("TESTBED_HTTP_ADDR", "0.0.0.0:5556"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::PortClash(5556)));
    }

    #[test]
    fn test_invalid_number() {
        let err = AgentConfig::from_lookup(lookup(&[
            ("TESTBED_ID", "tb-4"),
            ("TESTBED_EXEC_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("TESTBED_EXEC_TIMEOUT_SECS"));
    }
}
