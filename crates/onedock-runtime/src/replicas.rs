//! Replica set management
//!
//! Owns deploy, scale, and rolling-update semantics for one host. Management
//! operations are serialized per service; the container runtime stays the
//! system of record and every operation re-reads it.

use crate::error::{Result, RuntimeError};
use crate::naming::{ContainerName, NameCodec};
use crate::ports::PortAllocator;
use crate::runtime::{ContainerInfo, ContainerRuntime};
use onedock_spec::ServiceSpec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Grace period before a replica is killed on stop
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Allocation attempts before giving up on a create. The listen probe in the
/// allocator is racy against external processes, so a create can still hit a
/// taken port.
const CREATE_ATTEMPTS: u32 = 3;

/// Manages the replica set of every service on this host
pub struct ReplicaManager {
    runtime: Arc<dyn ContainerRuntime>,
    codec: NameCodec,
    allocator: PortAllocator,
    service_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReplicaManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        codec: NameCodec,
        allocator: PortAllocator,
    ) -> Self {
        Self {
            runtime,
            codec,
            allocator,
            service_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &NameCodec {
        &self.codec
    }

    /// Per-service lock; management operations on one service are sequential
    fn service_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.service_locks.lock().expect("lock map poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Deploy a new service: one replica at index 0, then scale out
    ///
    /// # Errors
    ///
    /// Fails when the spec has no public port, the image cannot be pulled, or
    /// the first replica cannot be created and started.
    pub async fn deploy(&self, spec: &ServiceSpec) -> Result<()> {
        if spec.public_port == 0 {
            return Err(RuntimeError::InvalidSpec(
                "public port cannot be empty".to_string(),
            ));
        }

        let _guard = self.service_lock(&spec.name).lock_owned().await;

        self.create_and_start(spec, 0).await?;
        tracing::info!(service = %spec.name, public_port = spec.public_port, "service deployed");

        if spec.replicas > 1 {
            // Best-effort: the first replica keeps serving if scale-out fails
            if let Err(e) = self.scale_locked(&spec.name, spec.replicas).await {
                tracing::error!(
                    service = %spec.name,
                    target = spec.replicas,
                    error = %e,
                    "scale-out after deploy failed"
                );
            }
        }

        Ok(())
    }

    /// Reconcile the replica count of a service to `target`
    ///
    /// Scale-up fills the smallest free indices; scale-down removes the
    /// highest indices first. Per-replica failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ServiceNotFound`] when `target > 0` and the
    /// service has no containers. `target = 0` on an unknown service is a
    /// no-op.
    pub async fn scale(&self, name: &str, target: u32) -> Result<()> {
        let _guard = self.service_lock(name).lock_owned().await;
        self.scale_locked(name, target).await
    }

    async fn scale_locked(&self, name: &str, target: u32) -> Result<()> {
        let replicas = self.service_containers(name).await?;
        let current = replicas.len() as u32;

        if target > current {
            if current == 0 {
                return Err(RuntimeError::ServiceNotFound {
                    service: name.to_string(),
                });
            }

            // The full spec is not carried across calls; rebuild what the
            // runtime can give us. Env, volumes and command come back empty.
            let spec = self.extract(&replicas[0].1)?;

            for _ in current..target {
                let index = self.next_replica_index(name).await?;
                match self.create_and_start(&spec, index).await {
                    Ok(id) => {
                        tracing::info!(
                            service = %name,
                            replica = index,
                            container = %&id[..12.min(id.len())],
                            "replica created"
                        );
                    }
                    Err(e) => {
                        tracing::error!(service = %name, replica = index, error = %e, "scale-up replica failed");
                    }
                }
            }
        } else if target < current {
            let mut removed = 0u32;
            for (parsed, container) in replicas.iter().rev() {
                if removed >= current - target {
                    break;
                }
                match self.remove_replica(container).await {
                    Ok(()) => {
                        removed += 1;
                        tracing::info!(service = %name, replica = parsed.replica_index, "replica removed");
                    }
                    Err(e) => {
                        tracing::error!(
                            service = %name,
                            replica = parsed.replica_index,
                            error = %e,
                            "scale-down replica failed"
                        );
                    }
                }
            }

            if removed < current - target {
                tracing::warn!(
                    service = %name,
                    expected = current - target,
                    removed,
                    "some replicas could not be removed"
                );
            }
        }

        Ok(())
    }

    /// Rolling update: rebuild every replica from `new_spec`, ascending index
    ///
    /// The public port never changes. Per-replica failures are logged and the
    /// update continues; the number of replaced replicas is returned.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ServiceNotFound`] when the service has no containers,
    /// [`RuntimeError::UpdateFailed`] when no replica could be replaced.
    pub async fn update(&self, new_spec: &ServiceSpec) -> Result<u32> {
        let _guard = self.service_lock(&new_spec.name).lock_owned().await;

        let replicas = self.service_containers(&new_spec.name).await?;
        if replicas.is_empty() {
            return Err(RuntimeError::ServiceNotFound {
                service: new_spec.name.clone(),
            });
        }

        if let Ok(old_spec) = self.extract(&replicas[0].1) {
            if !old_spec.differs_from(new_spec) {
                tracing::info!(service = %new_spec.name, "spec unchanged, replicas will be rebuilt anyway");
            }
        }

        let total = replicas.len() as u32;
        let mut replaced = 0u32;

        for (parsed, _) in &replicas {
            match self
                .update_replica_locked(new_spec, parsed.replica_index)
                .await
            {
                Ok(()) => {
                    replaced += 1;
                    tracing::info!(
                        service = %new_spec.name,
                        replica = parsed.replica_index,
                        "replica updated"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        service = %new_spec.name,
                        replica = parsed.replica_index,
                        error = %e,
                        "replica update failed"
                    );
                }
            }
        }

        if replaced == 0 {
            return Err(RuntimeError::UpdateFailed {
                service: new_spec.name.clone(),
            });
        }
        if replaced < total {
            tracing::warn!(service = %new_spec.name, total, replaced, "partial rolling update");
        }

        Ok(replaced)
    }

    /// Replace a single replica with one built from `spec`
    ///
    /// The new container is created and started before the old one is torn
    /// down, so the replica index is transiently shared; names stay unique
    /// because they encode the docker port.
    pub async fn update_replica(&self, spec: &ServiceSpec, replica_index: u32) -> Result<()> {
        let _guard = self.service_lock(&spec.name).lock_owned().await;
        self.update_replica_locked(spec, replica_index).await
    }

    async fn update_replica_locked(&self, spec: &ServiceSpec, replica_index: u32) -> Result<()> {
        let replicas = self.service_containers(&spec.name).await?;
        let old = replicas
            .iter()
            .find(|(parsed, _)| parsed.replica_index == replica_index)
            .map(|(_, container)| container.clone())
            .ok_or_else(|| RuntimeError::NotFound {
                container: format!("{}/{}", spec.name, replica_index),
                reason: "replica not found".to_string(),
            })?;

        let new_id = self.create_and_start(spec, replica_index).await?;
        tracing::info!(
            service = %spec.name,
            replica = replica_index,
            container = %&new_id[..12.min(new_id.len())],
            "replacement replica started"
        );

        // The old replica goes away regardless; the new one is already serving
        if let Err(e) = self.runtime.stop_container(&old.id, STOP_TIMEOUT).await {
            tracing::warn!(container = %old.short_id(), error = %e, "failed to stop old replica");
        }
        if let Err(e) = self.runtime.remove_container(&old.id).await {
            tracing::error!(container = %old.short_id(), error = %e, "failed to remove old replica");
        }

        Ok(())
    }

    /// Smallest non-negative index not used by any replica of `name`
    pub async fn next_replica_index(&self, name: &str) -> Result<u32> {
        let replicas = self.service_containers(name).await?;
        let used: HashSet<u32> = replicas
            .iter()
            .map(|(parsed, _)| parsed.replica_index)
            .collect();

        Ok((0..).find(|index| !used.contains(index)).unwrap_or(0))
    }

    /// Rebuild the recoverable part of a spec from a container
    ///
    /// Env, volumes, command, entrypoint and working dir cannot be recovered
    /// from runtime state and come back empty; callers that need them must
    /// carry the full spec through their own operation.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::MissingLabels`] when the management labels are absent
    /// or unparseable.
    pub fn extract(&self, container: &ContainerInfo) -> Result<ServiceSpec> {
        let parsed = self.codec.decode(&container.name)?;

        let label = |key: &str| {
            container
                .labels
                .get(&self.codec.label(key))
                .filter(|value| !value.is_empty())
                .cloned()
        };

        let missing = || RuntimeError::MissingLabels {
            container: container.name.clone(),
        };

        let name = label("service").ok_or_else(missing)?;
        let image = label("image").ok_or_else(missing)?;
        let tag = label("tag").ok_or_else(missing)?;
        let public_port: u16 = label("public_port")
            .and_then(|value| value.parse().ok())
            .ok_or_else(missing)?;

        let internal_port = container
            .ports
            .first()
            .map(|port| port.container_port)
            .unwrap_or(80);

        Ok(ServiceSpec {
            name,
            image,
            tag,
            public_port,
            internal_port,
            replicas: 1,
            ..Default::default()
        })
    }

    /// Containers of one service, sorted by replica index ascending
    pub async fn service_containers(
        &self,
        name: &str,
    ) -> Result<Vec<(ContainerName, ContainerInfo)>> {
        let containers = self.runtime.list_containers().await?;
        let mut replicas: Vec<(ContainerName, ContainerInfo)> = containers
            .into_iter()
            .filter_map(|container| {
                self.codec
                    .decode(&container.name)
                    .ok()
                    .filter(|parsed| parsed.service_name == name)
                    .map(|parsed| (parsed, container))
            })
            .collect();
        replicas.sort_by_key(|(parsed, _)| parsed.replica_index);
        Ok(replicas)
    }

    /// Allocate a port and create+start one replica, retrying allocation when
    /// the runtime reports the port as taken
    async fn create_and_start(&self, spec: &ServiceSpec, replica_index: u32) -> Result<String> {
        for attempt in 1..=CREATE_ATTEMPTS {
            let containers = self.runtime.list_containers().await?;
            let docker_port =
                self.allocator
                    .allocate(&containers, &self.codec, &[spec.public_port])?;

            let id = match self
                .runtime
                .create_container(spec, docker_port, replica_index)
                .await
            {
                Ok(id) => id,
                Err(e) if e.is_port_conflict() => {
                    tracing::warn!(
                        service = %spec.name,
                        port = docker_port,
                        attempt,
                        "allocated port was taken at create, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.runtime.start_container(&id).await {
                Ok(()) => return Ok(id),
                Err(e) => {
                    // A started-then-failed container must not linger
                    if let Err(remove_err) = self.runtime.remove_container(&id).await {
                        tracing::warn!(
                            container = %&id[..12.min(id.len())],
                            error = %remove_err,
                            "failed to clean up container after start failure"
                        );
                    }
                    if e.is_port_conflict() {
                        tracing::warn!(
                            service = %spec.name,
                            port = docker_port,
                            attempt,
                            "allocated port was taken at start, retrying"
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(RuntimeError::ResourceExhausted {
            start: self.allocator.start_port(),
        })
    }

    /// Stop with grace, then force-remove one replica
    async fn remove_replica(&self, container: &ContainerInfo) -> Result<()> {
        if let Err(e) = self.runtime.stop_container(&container.id, STOP_TIMEOUT).await {
            tracing::warn!(container = %container.short_id(), error = %e, "failed to stop replica");
        }
        self.runtime.remove_container(&container.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn manager() -> (Arc<MockRuntime>, ReplicaManager) {
        let codec = NameCodec::new("onedock");
        let runtime = Arc::new(MockRuntime::new(codec.clone()));
        let manager = ReplicaManager::new(
            runtime.clone(),
            codec,
            PortAllocator::new(30000),
        );
        (runtime, manager)
    }

    fn spec(replicas: u32) -> ServiceSpec {
        ServiceSpec {
            name: "nginx-web".to_string(),
            image: "nginx".to_string(),
            tag: "alpine".to_string(),
            internal_port: 80,
            public_port: 9203,
            replicas,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deploy_single_replica() {
        let (runtime, manager) = manager();
        manager.deploy(&spec(1)).await.unwrap();

        let names = runtime.container_names().await;
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("onedock-nginx-web-p9203-c"));
        assert!(names[0].ends_with("-0"));

        let containers = runtime.list_containers().await.unwrap();
        assert!(containers[0].is_running());
    }

    #[tokio::test]
    async fn test_deploy_rejects_zero_public_port() {
        let (_, manager) = manager();
        let mut bad = spec(1);
        bad.public_port = 0;
        assert!(matches!(
            manager.deploy(&bad).await,
            Err(RuntimeError::InvalidSpec(_))
        ));
    }

    #[tokio::test]
    async fn test_deploy_with_three_replicas() {
        let (runtime, manager) = manager();
        manager.deploy(&spec(3)).await.unwrap();

        let replicas = manager.service_containers("nginx-web").await.unwrap();
        assert_eq!(replicas.len(), 3);

        let indices: Vec<u32> = replicas.iter().map(|(p, _)| p.replica_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // All docker ports distinct
        let mut ports: Vec<u16> = replicas.iter().map(|(p, _)| p.docker_port).collect();
        ports.dedup();
        assert_eq!(ports.len(), 3);

        for container in runtime.list_containers().await.unwrap() {
            assert!(container.is_running());
        }
    }

    #[tokio::test]
    async fn test_scale_down_removes_highest_indices() {
        let (_, manager) = manager();
        manager.deploy(&spec(3)).await.unwrap();

        manager.scale("nginx-web", 1).await.unwrap();

        let replicas = manager.service_containers("nginx-web").await.unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].0.replica_index, 0);
    }

    #[tokio::test]
    async fn test_scale_to_zero_removes_everything() {
        let (runtime, manager) = manager();
        manager.deploy(&spec(2)).await.unwrap();

        manager.scale("nginx-web", 0).await.unwrap();
        assert!(runtime.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scale_zero_on_unknown_service_is_noop() {
        let (_, manager) = manager();
        assert!(manager.scale("ghost", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_scale_up_unknown_service_fails() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.scale("ghost", 2).await,
            Err(RuntimeError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_scale_up_fills_smallest_free_index() {
        let (_, manager) = manager();
        manager.deploy(&spec(3)).await.unwrap();
        manager.scale("nginx-web", 2).await.unwrap();
        manager.scale("nginx-web", 3).await.unwrap();

        let replicas = manager.service_containers("nginx-web").await.unwrap();
        let indices: Vec<u32> = replicas.iter().map(|(p, _)| p.replica_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_next_replica_index_minimality() {
        let (runtime, manager) = manager();
        // Build a gap: indices 0 and 2 present
        runtime.create_container(&spec(1), 30000, 0).await.unwrap();
        runtime.create_container(&spec(1), 30001, 2).await.unwrap();

        assert_eq!(manager.next_replica_index("nginx-web").await.unwrap(), 1);
        assert_eq!(manager.next_replica_index("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rolling_update_preserves_indices_and_public_port() {
        let (_, manager) = manager();
        manager.deploy(&spec(3)).await.unwrap();

        let before = manager.service_containers("nginx-web").await.unwrap();
        let old_ports: HashMap<u32, u16> = before
            .iter()
            .map(|(p, _)| (p.replica_index, p.docker_port))
            .collect();

        let mut new_spec = spec(3);
        new_spec.tag = "1.25-alpine".to_string();
        let replaced = manager.update(&new_spec).await.unwrap();
        assert_eq!(replaced, 3);

        let after = manager.service_containers("nginx-web").await.unwrap();
        assert_eq!(after.len(), 3);

        let indices: Vec<u32> = after.iter().map(|(p, _)| p.replica_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        for (parsed, container) in &after {
            assert_eq!(parsed.public_port, 9203);
            assert!(container.image.contains("1.25-alpine"));
            // Each replica was rebuilt on a port different from its own old one;
            // a port freed earlier in the roll may be reused by a later replica.
            assert_ne!(old_ports[&parsed.replica_index], parsed.docker_port);
            assert!(container.is_running());
        }
    }

    #[tokio::test]
    async fn test_update_unknown_service_fails() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.update(&spec(1)).await,
            Err(RuntimeError::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_with_all_replicas_failing() {
        let (runtime, manager) = manager();
        manager.deploy(&spec(2)).await.unwrap();

        runtime.set_fail_pulls(true);
        let mut new_spec = spec(2);
        new_spec.tag = "broken".to_string();

        assert!(matches!(
            manager.update(&new_spec).await,
            Err(RuntimeError::UpdateFailed { .. })
        ));

        // The old replicas are still there
        let replicas = manager.service_containers("nginx-web").await.unwrap();
        assert_eq!(replicas.len(), 2);
    }

    #[tokio::test]
    async fn test_extract_round_trips_label_fields() {
        let (runtime, manager) = manager();
        manager.deploy(&spec(1)).await.unwrap();

        let containers = runtime.list_containers().await.unwrap();
        let extracted = manager.extract(&containers[0]).unwrap();

        assert_eq!(extracted.name, "nginx-web");
        assert_eq!(extracted.image, "nginx");
        assert_eq!(extracted.tag, "alpine");
        assert_eq!(extracted.public_port, 9203);
        assert_eq!(extracted.internal_port, 80);
        assert!(extracted.environment.is_empty());
        assert!(extracted.volumes.is_empty());
    }

    #[tokio::test]
    async fn test_extract_without_labels_fails() {
        let (_, manager) = manager();
        let container = ContainerInfo {
            name: "onedock-web-p80-c30000-0".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            manager.extract(&container),
            Err(RuntimeError::MissingLabels { .. })
        ));
    }
}
