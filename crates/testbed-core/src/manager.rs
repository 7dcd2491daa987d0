//! Sandbox manager.
//!
//! The registry maps sandbox ids to their tracked state and
//! `(instance_ref, user_id)` request keys to the sandbox being created for
//! them. Each sandbox carries its own async lock, held across cluster calls
//! that change its lifecycle, so create and destroy on the same sandbox are
//! serialized while unrelated sandboxes proceed in parallel.

use crate::client::TestbedClient;
use crate::config::ManagerConfig;
use crate::error::{CoreError, Result};
use crate::eval::{InstanceCatalog, TestSpec};
use crate::sandbox::{SandboxId, SandboxInfo, SandboxStatus};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use testbed_cluster::{ClusterClient, ExposedEndpoint, WorkloadSpec};
use testbed_proto::{ChannelBinding, EndpointPair, TcpCommunicator, Waiter};
use tokio::sync::{Mutex, RwLock};

type RequestKey = (String, Option<String>);

struct Entry {
    info: SandboxInfo,
    lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct Registry {
    sandboxes: HashMap<SandboxId, Entry>,
    /// Request key → sandbox still being created for it.
    requests: HashMap<RequestKey, SandboxId>,
    /// Deleted sandboxes, oldest first.
    tombstones: VecDeque<SandboxId>,
}

impl Registry {
    fn entry_mut(&mut self, id: &SandboxId) -> Result<&mut Entry> {
        self.sandboxes
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))
    }

    /// Record `id` as deleted and forget the oldest deletions beyond `keep`.
    fn bury(&mut self, id: &SandboxId, keep: usize) {
        self.tombstones.push_back(id.clone());
        while self.tombstones.len() > keep {
            let Some(oldest) = self.tombstones.pop_front() else {
                break;
            };
            self.sandboxes.remove(&oldest);
            tracing::debug!(sandbox_id = %oldest, "Forgot deleted sandbox");
        }
    }

    fn live_count(&self) -> usize {
        self.sandboxes
            .values()
            .filter(|e| e.info.status.is_live())
            .count()
    }
}

/// Manages testbed sandboxes on a cluster.
pub struct SandboxManager {
    cluster: Arc<dyn ClusterClient>,
    catalog: Arc<dyn InstanceCatalog>,
    config: ManagerConfig,
    registry: RwLock<Registry>,
}

impl SandboxManager {
    /// Create a manager. Fails if `config` is invalid.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        catalog: Arc<dyn InstanceCatalog>,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            max_sandboxes = config.max_sandboxes,
            image_template = %config.image_template,
            "Creating sandbox manager"
        );
        Ok(Self {
            cluster,
            catalog,
            config,
            registry: RwLock::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Request a sandbox for `instance_ref`.
    ///
    /// While an earlier request with the same `(instance_ref, user_id)` is
    /// still being provisioned, its id is returned and no second workload is
    /// submitted.
    pub async fn create(&self, instance_ref: &str, user_id: Option<&str>) -> Result<SandboxId> {
        if instance_ref.trim().is_empty() {
            return Err(CoreError::InvalidArgument("instance_ref is empty".into()));
        }
        let key: RequestKey = (instance_ref.to_string(), user_id.map(String::from));

        let (id, _guard) = {
            let mut registry = self.registry.write().await;

            if let Some(id) = registry.requests.get(&key).cloned() {
                match registry.sandboxes.get(&id) {
                    Some(entry) if entry.info.status.is_pending() => {
                        let lock = entry.lock.clone();
                        drop(registry);
                        return self.join_pending(id, lock, instance_ref).await;
                    }
                    _ => {
                        registry.requests.remove(&key);
                    }
                }
            }

            let live = registry.live_count();
            if live >= self.config.max_sandboxes {
                tracing::warn!(live, max = self.config.max_sandboxes, "Sandbox limit reached");
                return Err(CoreError::LimitReached(self.config.max_sandboxes));
            }

            let id = SandboxId::generate(instance_ref);
            let lock = Arc::new(Mutex::new(()));
            // Fresh lock, acquired immediately.
            let guard = lock.clone().lock_owned().await;
            registry.sandboxes.insert(
                id.clone(),
                Entry {
                    info: SandboxInfo::new(id.clone(), instance_ref, user_id),
                    lock,
                },
            );
            registry.requests.insert(key.clone(), id.clone());
            (id, guard)
        };

        let spec = self.workload_spec(&id, instance_ref, user_id);
        tracing::info!(
            sandbox_id = %id,
            instance_ref,
            user_id = ?user_id,
            image = %spec.image,
            "Submitting workload"
        );
        let submitted = self.cluster.submit_workload(&spec).await;

        let mut registry = self.registry.write().await;
        match submitted {
            Ok(()) => {
                registry
                    .entry_mut(&id)?
                    .info
                    .advance(SandboxStatus::Provisioning, "submit workload")?;
                tracing::info!(sandbox_id = %id, "Workload submitted");
                Ok(id)
            }
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Cluster refused workload");
                registry.requests.remove(&key);
                let entry = registry.entry_mut(&id)?;
                entry.info.advance(SandboxStatus::Failed, "record failure")?;
                entry.info.error = Some(e.to_string());
                Err(CoreError::Provisioning {
                    instance_ref: instance_ref.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Wait for an in-flight create and report its outcome.
    async fn join_pending(
        &self,
        id: SandboxId,
        lock: Arc<Mutex<()>>,
        instance_ref: &str,
    ) -> Result<SandboxId> {
        tracing::debug!(sandbox_id = %id, "Joining in-flight create");
        let _guard = lock.lock().await;
        let registry = self.registry.read().await;
        let entry = registry
            .sandboxes
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        if entry.info.status == SandboxStatus::Failed {
            return Err(CoreError::Provisioning {
                instance_ref: instance_ref.to_string(),
                reason: entry
                    .info
                    .error
                    .clone()
                    .unwrap_or_else(|| "workload submission failed".into()),
            });
        }
        Ok(id)
    }

    fn workload_spec(&self, id: &SandboxId, instance_ref: &str, user_id: Option<&str>) -> WorkloadSpec {
        let ports = self.config.ports;
        let mut env = BTreeMap::new();
        env.insert("TESTBED_ID".to_string(), id.to_string());
        env.insert(
            "TESTBED_PUBLISH_ADDR".to_string(),
            format!("0.0.0.0:{}", ports.publish),
        );
        env.insert(
            "TESTBED_SUBSCRIBE_ADDR".to_string(),
            format!("0.0.0.0:{}", ports.subscribe),
        );
        env.insert(
            "TESTBED_HTTP_ADDR".to_string(),
            format!("0.0.0.0:{}", ports.http),
        );
        WorkloadSpec {
            name: id.to_string(),
            instance_ref: instance_ref.to_string(),
            user_id: user_id.map(String::from),
            image: self.config.image_for(instance_ref),
            command: self.config.agent_command.clone(),
            env,
            ports,
        }
    }

    async fn entry_lock(&self, id: &SandboxId) -> Option<Arc<Mutex<()>>> {
        self.registry
            .read()
            .await
            .sandboxes
            .get(id)
            .map(|e| e.lock.clone())
    }

    /// Wait until the sandbox's endpoint resolves and return a client bound
    /// to it.
    ///
    /// On timeout the sandbox stays `Provisioning`, so the caller can retry
    /// or destroy it.
    pub async fn create_client(&self, id: &SandboxId, timeout: Duration) -> Result<TestbedClient> {
        let mut waiter = Waiter::new(timeout, self.config.endpoint_poll_interval);
        let mut lookups = 0u32;

        while waiter.tick().await {
            let info = self.get(id).await?;
            match info.status {
                // Submission still in flight.
                SandboxStatus::Requested => continue,
                SandboxStatus::Ready => {
                    if let Some(pair) = info.endpoints {
                        return self.attach(id, pair).await;
                    }
                }
                SandboxStatus::Provisioning => {}
                status => {
                    return Err(CoreError::InvalidState {
                        id: id.clone(),
                        status,
                        operation: "attach a client",
                    })
                }
            }

            lookups += 1;
            let lookup = self.cluster.resolve_endpoint(id.as_str());
            let Ok(resolved) = tokio::time::timeout(waiter.remaining(), lookup).await else {
                tracing::warn!(sandbox_id = %id, lookups, "Endpoint lookup did not return in time");
                break;
            };
            match resolved {
                Ok(Some(endpoint)) => {
                    tracing::info!(
                        sandbox_id = %id,
                        host = %endpoint.host,
                        lookups,
                        elapsed_ms = waiter.elapsed().as_millis() as u64,
                        "Endpoint resolved"
                    );
                    return self.attach(id, pair_of(&endpoint)).await;
                }
                Ok(None) => tracing::trace!(sandbox_id = %id, lookups, "Endpoint not ready yet"),
                Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Endpoint lookup failed, retrying"),
            }
        }

        tracing::warn!(
            sandbox_id = %id,
            lookups,
            timeout_secs = timeout.as_secs(),
            "Endpoint did not become resolvable"
        );
        Err(CoreError::EndpointTimeout {
            id: id.clone(),
            waited: waiter.elapsed(),
        })
    }

    /// Record `pair`, mark the sandbox InUse and open the channel binding.
    async fn attach(&self, id: &SandboxId, pair: EndpointPair) -> Result<TestbedClient> {
        let lock = self
            .entry_lock(id)
            .await
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        let _guard = lock.lock().await;

        let instance_ref = {
            let mut registry = self.registry.write().await;
            let info = &mut registry.entry_mut(id)?.info;
            if info.status == SandboxStatus::Provisioning {
                info.advance(SandboxStatus::Ready, "record endpoint")?;
            }
            info.endpoints = Some(pair.clone());
            info.advance(SandboxStatus::InUse, "attach a client")?;
            info.instance_ref.clone()
        };

        let binding = ChannelBinding::client(id.as_str(), &pair);
        let comm = match TcpCommunicator::open(binding).await {
            Ok(comm) => comm,
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to open channel binding");
                let mut registry = self.registry.write().await;
                registry
                    .entry_mut(id)?
                    .info
                    .advance(SandboxStatus::Ready, "release client")?;
                return Err(e.into());
            }
        };

        let spec = self.catalog.test_spec(&instance_ref).unwrap_or_else(|| {
            tracing::debug!(sandbox_id = %id, instance_ref, "No catalog entry, using default test spec");
            TestSpec::new(instance_ref.clone())
        });

        tracing::info!(
            sandbox_id = %id,
            publish = %pair.publish,
            subscribe = %pair.subscribe,
            "Client attached"
        );
        Ok(TestbedClient::new(
            id.clone(),
            Arc::new(comm),
            spec,
            self.config.client.clone(),
        ))
    }

    /// Release the client binding: InUse → Ready.
    pub async fn reset(&self, id: &SandboxId) -> Result<()> {
        let lock = self
            .entry_lock(id)
            .await
            .ok_or_else(|| CoreError::NotFound(id.clone()))?;
        let _guard = lock.lock().await;
        let mut registry = self.registry.write().await;
        let info = &mut registry.entry_mut(id)?.info;
        if info.status != SandboxStatus::InUse {
            return Err(CoreError::InvalidState {
                id: id.clone(),
                status: info.status,
                operation: "reset",
            });
        }
        info.advance(SandboxStatus::Ready, "reset")
    }

    /// Tear the sandbox down. Destroying an absent sandbox succeeds.
    pub async fn destroy(&self, id: &SandboxId) -> Result<()> {
        let Some(lock) = self.entry_lock(id).await else {
            // Not ours, or from before a restart: make sure nothing is left.
            let existed = self.cluster.delete_workload(id.as_str()).await?;
            tracing::info!(sandbox_id = %id, existed, "Destroyed unregistered sandbox");
            return Ok(());
        };
        let _guard = lock.lock().await;

        {
            let mut registry = self.registry.write().await;
            let info = &mut registry.entry_mut(id)?.info;
            match info.status {
                SandboxStatus::Deleted => return Ok(()),
                // An earlier delete failed. Try again.
                SandboxStatus::Terminating => {}
                _ => info.advance(SandboxStatus::Terminating, "destroy")?,
            }
            registry.requests.retain(|_, pending| pending != id);
        }

        tracing::info!(sandbox_id = %id, "Deleting workload");
        let existed = match self.cluster.delete_workload(id.as_str()).await {
            Ok(existed) => existed,
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to delete workload");
                return Err(e.into());
            }
        };

        let mut registry = self.registry.write().await;
        registry
            .entry_mut(id)?
            .info
            .advance(SandboxStatus::Deleted, "destroy")?;
        registry.bury(id, self.config.retain_deleted);
        tracing::info!(sandbox_id = %id, existed, "Sandbox destroyed");
        Ok(())
    }

    /// Destroy every sandbox of `user_id`, or all of them for `None`.
    /// Returns how many were destroyed.
    pub async fn destroy_all(&self, user_id: Option<&str>) -> usize {
        let ids: Vec<SandboxId> = self
            .list(user_id)
            .await
            .into_iter()
            .map(|info| info.id)
            .collect();

        let mut destroyed = 0;
        for id in ids {
            match self.destroy(&id).await {
                Ok(()) => destroyed += 1,
                Err(e) => tracing::error!(sandbox_id = %id, error = %e, "Failed to destroy sandbox"),
            }
        }
        tracing::info!(destroyed, user_id = ?user_id, "Destroyed sandboxes");
        destroyed
    }

    pub async fn status(&self, id: &SandboxId) -> Result<SandboxStatus> {
        Ok(self.get(id).await?.status)
    }

    pub async fn get(&self, id: &SandboxId) -> Result<SandboxInfo> {
        self.registry
            .read()
            .await
            .sandboxes
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| CoreError::NotFound(id.clone()))
    }

    /// Sandboxes that are not deleted, oldest first, optionally of one user.
    pub async fn list(&self, user_id: Option<&str>) -> Vec<SandboxInfo> {
        let registry = self.registry.read().await;
        let mut infos: Vec<SandboxInfo> = registry
            .sandboxes
            .values()
            .map(|e| &e.info)
            .filter(|info| info.status != SandboxStatus::Deleted && info.belongs_to(user_id))
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }
}

fn pair_of(endpoint: &ExposedEndpoint) -> EndpointPair {
    EndpointPair::new(&endpoint.host, endpoint.publish_port, endpoint.subscribe_port)
}
