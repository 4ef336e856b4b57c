//! Service orchestration facade
//!
//! Sequences the replica manager, the mapping cache and the proxy fleet so
//! that every lifecycle transition follows `runtime mutation -> cache
//! invalidate -> proxy transition`. Proxy-fleet failures never fail the
//! containing management operation; they are logged for inspection through
//! the stats surface.

use crate::cache::MappingCache;
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use onedock_proxy::{BackendSource, BalanceStrategy, FleetStats, ProxyError, ProxyFleet, RecoverReport};
use onedock_runtime::{
    ContainerInfo, ContainerName, ContainerRuntime, NameCodec, PortAllocator, ReplicaManager,
    RuntimeError,
};
use onedock_spec::{Service, ServiceInstance, ServiceSpec, ServiceState, ServiceStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Top-level facade over replica lifecycle, mapping cache and proxy fleet
pub struct ServiceOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    codec: NameCodec,
    replicas: ReplicaManager,
    cache: Arc<MappingCache>,
    fleet: ProxyFleet,
    strategy: BalanceStrategy,
}

impl ServiceOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        codec: NameCodec,
        allocator: PortAllocator,
        cache_ttl: Duration,
        strategy: BalanceStrategy,
    ) -> Self {
        let cache = Arc::new(MappingCache::new(
            Arc::clone(&runtime),
            codec.clone(),
            cache_ttl,
        ));
        let fleet = ProxyFleet::new(Arc::clone(&cache) as Arc<dyn BackendSource>, strategy);
        let replicas = ReplicaManager::new(Arc::clone(&runtime), codec.clone(), allocator);

        Self {
            runtime,
            codec,
            replicas,
            cache,
            fleet,
            strategy,
        }
    }

    /// Deploy a new service or roll-update an existing one
    ///
    /// The public port of an existing service is kept regardless of what the
    /// new spec says.
    pub async fn deploy_or_update(&self, mut spec: ServiceSpec) -> Result<Service> {
        spec.validate()?;
        if spec.replicas == 0 {
            spec.replicas = 1;
        }

        match self.get(&spec.name).await? {
            Some(existing) => {
                info!(service = %spec.name, "service exists, rolling update");
                spec.public_port = existing.public_port;

                self.replicas.update(&spec).await?;

                self.cache.invalidate(existing.public_port).await;
                if let Err(e) = self.fleet.update(existing.public_port).await {
                    error!(
                        port = existing.public_port,
                        error = %e,
                        "failed to rebuild proxy after update"
                    );
                }
            }
            None => {
                self.replicas.deploy(&spec).await?;

                self.cache.invalidate(spec.public_port).await;
                match self.fleet.start(spec.public_port).await {
                    Ok(()) => {}
                    // A deploy that yields zero running backends is an
                    // operator-visible fault; other proxy errors are not.
                    Err(e @ ProxyError::NoBackends { .. }) => return Err(e.into()),
                    Err(e) => {
                        error!(port = spec.public_port, error = %e, "failed to start proxy");
                    }
                }
            }
        }

        self.get(&spec.name).await?.ok_or_else(|| {
            OrchestratorError::Runtime(RuntimeError::Internal(format!(
                "service '{}' has no containers after deploy",
                spec.name
            )))
        })
    }

    /// All managed services, grouped from the container list
    pub async fn list(&self) -> Result<Vec<Service>> {
        let groups = self.grouped_containers().await?;

        let mut services = Vec::with_capacity(groups.len());
        for (name, containers) in groups {
            match self.build_service(&containers) {
                Some(service) => services.push(service),
                None => warn!(service = %name, "skipping service with unusable containers"),
            }
        }

        Ok(services)
    }

    /// One service by name
    pub async fn get(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.list().await?.into_iter().find(|s| s.name == name))
    }

    /// Detailed per-replica status of one service
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ServiceNotFound`] when no containers back the name.
    pub async fn status(&self, name: &str) -> Result<ServiceStatus> {
        let groups = self.grouped_containers().await?;
        let containers = groups
            .get(name)
            .filter(|containers| !containers.is_empty())
            .ok_or_else(|| RuntimeError::ServiceNotFound {
                service: name.to_string(),
            })?;

        let service = self.build_service(containers).ok_or_else(|| {
            RuntimeError::MissingLabels {
                container: containers[0].1.name.clone(),
            }
        })?;

        let mut instances = Vec::with_capacity(containers.len());
        let mut running = 0u32;
        let mut stopped = 0u32;

        for (parsed, container) in containers {
            if container.is_running() {
                running += 1;
            } else {
                stopped += 1;
            }

            instances.push(ServiceInstance {
                id: container.short_id().to_string(),
                container_id: container.id.clone(),
                container_name: container.name.clone(),
                service_name: name.to_string(),
                state: container.state.clone(),
                public_port: parsed.public_port,
                docker_port: parsed.docker_port,
                internal_port: service.internal_port,
                image: container.image.clone(),
                labels: container.labels.clone(),
                created_at: timestamp(container.created_at),
                cpu_usage: 0.0,
                memory_usage: 0.0,
            });
        }

        let access_url = format!("http://localhost:{}/", service.public_port);
        Ok(ServiceStatus {
            total_replicas: instances.len() as u32,
            running_replicas: running,
            stopped_replicas: stopped,
            instances,
            load_balancer: self.strategy.as_str().to_string(),
            access_url,
            service,
        })
    }

    /// Reconcile replica count, then rebuild or stop the port's proxy
    ///
    /// `target = 0` on an unknown service is a no-op.
    pub async fn scale(&self, name: &str, target: u32) -> Result<()> {
        let Some(service) = self.get(name).await? else {
            if target == 0 {
                return Ok(());
            }
            return Err(RuntimeError::ServiceNotFound {
                service: name.to_string(),
            }
            .into());
        };

        self.replicas.scale(name, target).await?;
        self.cache.invalidate(service.public_port).await;

        if target == 0 {
            self.fleet.stop(service.public_port).await;
            info!(service = %name, port = service.public_port, "service removed");
        } else if let Err(e) = self.fleet.update(service.public_port).await {
            // Scale itself succeeded; the operator sees the proxy state in stats
            error!(
                service = %name,
                port = service.public_port,
                error = %e,
                "failed to rebuild proxy after scale"
            );
        }

        Ok(())
    }

    /// Remove a service entirely
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.scale(name, 0).await
    }

    /// Snapshot of the proxy fleet
    pub async fn proxy_stats(&self) -> FleetStats {
        self.fleet.stats().await
    }

    /// Restart proxies for services found in the runtime, at daemon boot
    pub async fn recover(&self) -> RecoverReport {
        self.fleet.recover().await
    }

    /// Stop every proxy; replicas keep running under the container runtime
    pub async fn shutdown(&self) -> Result<()> {
        self.fleet.shutdown().await?;
        Ok(())
    }

    async fn grouped_containers(
        &self,
    ) -> Result<BTreeMap<String, Vec<(ContainerName, ContainerInfo)>>> {
        let containers = self.runtime.list_containers().await.map_err(OrchestratorError::Runtime)?;

        let mut groups: BTreeMap<String, Vec<(ContainerName, ContainerInfo)>> = BTreeMap::new();
        for container in containers {
            // Unparseable names are silently skipped from listings
            let Ok(parsed) = self.codec.decode(&container.name) else {
                continue;
            };
            groups
                .entry(parsed.service_name.clone())
                .or_default()
                .push((parsed, container));
        }

        for containers in groups.values_mut() {
            containers.sort_by_key(|(parsed, _)| parsed.replica_index);
        }
        Ok(groups)
    }

    /// Build the summary view from one service's containers
    fn build_service(&self, containers: &[(ContainerName, ContainerInfo)]) -> Option<Service> {
        let (parsed, first) = containers.first()?;

        let base = match self.replicas.extract(first) {
            Ok(spec) => spec,
            Err(e) => {
                // Labels are gone; fall back to what the name and image carry
                warn!(container = %first.name, error = %e, "falling back to name-derived fields");
                let (image, tag) = split_image_ref(&first.image);
                ServiceSpec {
                    name: parsed.service_name.clone(),
                    image,
                    tag,
                    public_port: parsed.public_port,
                    internal_port: first
                        .ports
                        .first()
                        .map(|p| p.container_port)
                        .unwrap_or(80),
                    ..Default::default()
                }
            }
        };

        let status = containers
            .iter()
            .find(|(_, c)| c.is_running())
            .map(|_| ServiceState::Running)
            .unwrap_or_else(|| ServiceState::from_container_state(&first.state));

        let created = containers.iter().filter_map(|(_, c)| c.created_at).min();
        let updated = containers.iter().filter_map(|(_, c)| c.created_at).max();

        Some(Service {
            id: first.short_id().to_string(),
            name: base.name,
            image: base.image,
            tag: base.tag,
            status,
            public_port: base.public_port,
            internal_port: base.internal_port,
            replicas: containers.len() as u32,
            created_at: timestamp(created),
            updated_at: timestamp(updated),
        })
    }
}

fn timestamp(unix_secs: Option<i64>) -> Option<DateTime<Utc>> {
    unix_secs.and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Split `image:tag` into its parts; registry ports are not tags
fn split_image_ref(image_ref: &str) -> (String, String) {
    if let Some((image, tag)) = image_ref.rsplit_once(':') {
        if !tag.contains('/') {
            return (image.to_string(), tag.to_string());
        }
    }
    (image_ref.to_string(), "latest".to_string())
}
