//! Kubernetes backend, reached through `kubectl proxy`.
//!
//! The proxy handles authentication, so plain HTTP against the local proxy
//! port is all that is needed here.

use crate::cluster::ClusterClient;
use crate::error::{ClusterError, Result};
use crate::manifest;
use crate::workload::{ExposedEndpoint, WorkloadPorts, WorkloadSpec};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Default `kubectl proxy` address.
pub const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:8001";

/// Limit for one API request, response body included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ClusterClient`] creating one Job and one Service per workload.
pub struct KubeProxyCluster {
    client: Client<HttpConnector>,
    base_url: String,
    namespace: String,
    in_cluster: bool,
    ports: WorkloadPorts,
    request_timeout: Duration,
}

impl KubeProxyCluster {
    pub fn new(base_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            in_cluster: false,
            ports: WorkloadPorts::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Resolve endpoints to service DNS names instead of load balancer
    /// addresses. Use when the caller runs inside the cluster.
    pub fn in_cluster(mut self, in_cluster: bool) -> Self {
        self.in_cluster = in_cluster;
        self
    }

    /// Ports reported for resolved endpoints.
    pub fn with_ports(mut self, ports: WorkloadPorts) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs_path(&self) -> String {
        format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace)
    }

    fn services_path(&self) -> String {
        format!("/api/v1/namespaces/{}/services", self.namespace)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value)> {
        let uri = format!("{}{}", self.base_url, path);
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(value)?),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body)
            .map_err(|e| ClusterError::Transport(format!("failed to build request: {e}")))?;

        tracing::trace!(%method, %uri, "Cluster API request");
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                tracing::error!(error = %e, %uri, "Cluster API request failed");
                ClusterError::Transport(e.to_string())
            })?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| ClusterError::Transport(format!("failed to read response: {e}")))?;
            Ok::<_, ClusterError>((status, bytes))
        };
        let (status, bytes) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                tracing::error!(
                    %method,
                    %uri,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Cluster API request timed out"
                );
                ClusterError::Transport(format!(
                    "request timed out after {}ms",
                    self.request_timeout.as_millis()
                ))
            })??;

        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        Ok((status, value))
    }

    async fn create(&self, path: &str, name: &str, object: &Value) -> Result<()> {
        let (status, body) = self.request(Method::POST, path, Some(object)).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(creation_error(status, name, &body))
    }

    /// Delete one object. Returns `false` when it did not exist.
    async fn delete(&self, path: &str) -> Result<bool> {
        let options = manifest::foreground_delete();
        let (status, body) = self
            .request(Method::DELETE, path, Some(&options))
            .await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(ClusterError::Api {
                status: s.as_u16(),
                message: status_message(&body),
            }),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeProxyCluster {
    async fn submit_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let start = std::time::Instant::now();
        let job = manifest::job(spec, &self.namespace);
        self.create(&self.jobs_path(), &spec.name, &job).await?;

        let service = manifest::service(spec, &self.namespace, self.in_cluster);
        if let Err(e) = self
            .create(&self.services_path(), &spec.name, &service)
            .await
        {
            tracing::warn!(workload = %spec.name, error = %e, "Service creation failed, removing job");
            let job_path = format!("{}/{}", self.jobs_path(), spec.name);
            if let Err(cleanup) = self.delete(&job_path).await {
                tracing::error!(workload = %spec.name, error = %cleanup, "Failed to remove orphaned job");
            }
            return Err(e);
        }

        tracing::info!(
            workload = %spec.name,
            namespace = %self.namespace,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Workload submitted"
        );
        Ok(())
    }

    async fn resolve_endpoint(&self, name: &str) -> Result<Option<ExposedEndpoint>> {
        let path = format!("{}/{}", self.services_path(), name);
        let (status, body) = self.request(Method::GET, &path, None).await?;
        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Ok(None),
            s => {
                return Err(ClusterError::Api {
                    status: s.as_u16(),
                    message: status_message(&body),
                })
            }
        }

        let host = if self.in_cluster {
            Some(format!("{name}.{}.svc.cluster.local", self.namespace))
        } else {
            load_balancer_host(&body)
        };

        Ok(host.map(|host| ExposedEndpoint {
            host,
            publish_port: self.ports.publish,
            subscribe_port: self.ports.subscribe,
        }))
    }

    async fn delete_workload(&self, name: &str) -> Result<bool> {
        let service = self
            .delete(&format!("{}/{}", self.services_path(), name))
            .await?;
        let job = self.delete(&format!("{}/{}", self.jobs_path(), name)).await?;
        tracing::info!(workload = name, service, job, "Workload deleted");
        Ok(service || job)
    }
}

/// First ingress address of a LoadBalancer service, ip preferred.
fn load_balancer_host(service: &Value) -> Option<String> {
    let ingress = service
        .pointer("/status/loadBalancer/ingress")?
        .as_array()?
        .first()?;
    ingress
        .get("ip")
        .or_else(|| ingress.get("hostname"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn status_message(body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| body.to_string())
}

fn creation_error(status: StatusCode, name: &str, body: &Value) -> ClusterError {
    match status {
        StatusCode::CONFLICT => ClusterError::Conflict(name.to_string()),
        StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY => {
            ClusterError::Rejected(status_message(body))
        }
        s => ClusterError::Api {
            status: s.as_u16(),
            message: status_message(body),
        },
    }
}
