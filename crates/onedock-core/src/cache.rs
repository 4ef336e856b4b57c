//! TTL cache over the `publicPort -> containers` relation
//!
//! A latency optimization only: correctness never depends on the cache, and
//! every miss rebuilds from the container runtime. State-changing operations
//! must invalidate the touched port before the proxy fleet is rebuilt.

use async_trait::async_trait;
use onedock_proxy::{BackendSource, ProxyError};
use onedock_runtime::{ContainerRuntime, NameCodec, Result as RuntimeResult};
use onedock_spec::ContainerMapping;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

struct CacheEntry {
    built_at: Instant,
    mappings: Vec<ContainerMapping>,
}

/// Write-through TTL cache mapping public ports to their backing containers
pub struct MappingCache {
    runtime: Arc<dyn ContainerRuntime>,
    codec: NameCodec,
    ttl: Duration,
    entries: RwLock<HashMap<u16, CacheEntry>>,
}

impl MappingCache {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, codec: NameCodec, ttl: Duration) -> Self {
        Self {
            runtime,
            codec,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Mappings for one public port, rebuilt from the runtime on miss
    ///
    /// Only running containers whose decoded public port matches are
    /// returned. Empty results are not cached, so a port coming online is
    /// seen on the next call.
    pub async fn get(&self, public_port: u16) -> RuntimeResult<Vec<ContainerMapping>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&public_port) {
                if entry.built_at.elapsed() < self.ttl && !entry.mappings.is_empty() {
                    return Ok(entry.mappings.clone());
                }
            }
        }

        let mappings = self.rebuild(public_port).await?;

        if !mappings.is_empty() {
            let mut entries = self.entries.write().await;
            entries.insert(
                public_port,
                CacheEntry {
                    built_at: Instant::now(),
                    mappings: mappings.clone(),
                },
            );
        }

        Ok(mappings)
    }

    /// Drop the entry for one public port
    pub async fn invalidate(&self, public_port: u16) {
        let removed = self.entries.write().await.remove(&public_port);
        if removed.is_some() {
            debug!(port = public_port, "mapping cache invalidated");
        }
    }

    async fn rebuild(&self, public_port: u16) -> RuntimeResult<Vec<ContainerMapping>> {
        let containers = self.runtime.list_containers().await?;

        let mappings = containers
            .into_iter()
            .filter(|container| container.is_running())
            .filter_map(|container| {
                let parsed = self.codec.decode(&container.name).ok()?;
                (parsed.public_port == public_port).then(|| ContainerMapping {
                    public_port,
                    docker_port: parsed.docker_port,
                    container_id: container.id,
                    service_name: parsed.service_name,
                })
            })
            .collect();

        debug!(port = public_port, "mapping cache rebuilt from runtime");
        Ok(mappings)
    }
}

#[async_trait]
impl BackendSource for MappingCache {
    async fn backends_for(
        &self,
        public_port: u16,
    ) -> Result<Vec<ContainerMapping>, ProxyError> {
        self.get(public_port)
            .await
            .map_err(|e| ProxyError::BackendResolution(e.to_string()))
    }

    async fn active_public_ports(&self) -> Result<Vec<u16>, ProxyError> {
        let containers = self
            .runtime
            .list_containers()
            .await
            .map_err(|e| ProxyError::BackendResolution(e.to_string()))?;

        let mut ports: HashSet<u16> = HashSet::new();
        for container in &containers {
            if let Ok(parsed) = self.codec.decode(&container.name) {
                if parsed.public_port > 0 {
                    ports.insert(parsed.public_port);
                }
            }
        }

        let mut ports: Vec<u16> = ports.into_iter().collect();
        ports.sort_unstable();
        Ok(ports)
    }
}
