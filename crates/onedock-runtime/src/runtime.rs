//! Abstract container runtime interface
//!
//! Defines the [`ContainerRuntime`] trait the replica manager and mapping
//! cache are written against, plus an in-memory [`MockRuntime`] used by
//! tests.

use crate::error::{Result, RuntimeError};
use crate::naming::NameCodec;
use async_trait::async_trait;
use onedock_spec::ServiceSpec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// One host-port binding of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBindingInfo {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

/// Snapshot of one managed container as reported by the runtime
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    /// Full container id
    pub id: String,
    /// Container name without the leading slash
    pub name: String,
    /// Image reference the container was created from
    pub image: String,
    /// Normalized state, e.g. `running`, `exited`
    pub state: String,
    /// Human-readable status line
    pub status: String,
    pub ports: Vec<PortBindingInfo>,
    pub labels: HashMap<String, String>,
    /// Creation time, unix seconds
    pub created_at: Option<i64>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// First 12 chars of the container id, the short form shown to operators
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Abstract container runtime
///
/// All calls are blocking I/O against the local daemon and honor the caller's
/// cancellation through future drop. `list` and `inspect` only surface
/// containers whose name matches the managed prefix.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image to local storage
    async fn pull_image(&self, image: &str, tag: &str) -> Result<()>;

    /// Create one replica container; pulls the image first
    async fn create_container(
        &self,
        spec: &ServiceSpec,
        docker_port: u16,
        replica_index: u32,
    ) -> Result<String>;

    /// Start a container
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, giving it `timeout` to exit before SIGKILL
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Force-remove a container
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// List managed containers, running or not
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Inspect a single container
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;
}

/// In-memory mock runtime for tests
///
/// Behaves like the Docker adapter from the replica manager's point of view:
/// names are encoded with the same codec, labels are written the same way,
/// and `list` filters to managed names.
pub struct MockRuntime {
    codec: NameCodec,
    containers: RwLock<HashMap<String, ContainerInfo>>,
    next_id: AtomicU64,
    fail_pulls: AtomicBool,
}

impl MockRuntime {
    pub fn new(codec: NameCodec) -> Self {
        Self {
            codec,
            containers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fail_pulls: AtomicBool::new(false),
        }
    }

    /// Make subsequent pulls fail, to exercise error paths
    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all container names, for assertions
    pub async fn container_names(&self) -> Vec<String> {
        let containers = self.containers.read().await;
        let mut names: Vec<String> = containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, image: &str, _tag: &str) -> Result<()> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason: "pull disabled by test".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(
        &self,
        spec: &ServiceSpec,
        docker_port: u16,
        replica_index: u32,
    ) -> Result<String> {
        self.pull_image(&spec.image, &spec.tag).await?;

        let name = self
            .codec
            .encode(&spec.name, spec.public_port, docker_port, replica_index);

        let mut containers = self.containers.write().await;
        if containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::CreateFailed {
                name,
                reason: "name already in use".to_string(),
            });
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{:064x}", seq);

        let labels = HashMap::from([
            (self.codec.label("managed"), "true".to_string()),
            (self.codec.label("service"), spec.name.clone()),
            (self.codec.label("image"), spec.image.clone()),
            (self.codec.label("tag"), spec.tag.clone()),
            (
                self.codec.label("public_port"),
                spec.public_port.to_string(),
            ),
        ]);

        containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name,
                image: spec.image_ref(),
                state: "created".to_string(),
                status: "Created".to_string(),
                ports: vec![PortBindingInfo {
                    host_port: docker_port,
                    container_port: spec.internal_port,
                    protocol: "tcp".to_string(),
                }],
                labels,
                created_at: Some(chrono::Utc::now().timestamp()),
            },
        );

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = containers.get_mut(id).ok_or_else(|| RuntimeError::NotFound {
            container: id.to_string(),
            reason: "container not found".to_string(),
        })?;
        container.state = "running".to_string();
        container.status = "Up 1 second".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = containers.get_mut(id).ok_or_else(|| RuntimeError::NotFound {
            container: id.to_string(),
            reason: "container not found".to_string(),
        })?;
        container.state = "exited".to_string();
        container.status = "Exited (0)".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound {
                container: id.to_string(),
                reason: "container not found".to_string(),
            })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let containers = self.containers.read().await;
        let mut managed: Vec<ContainerInfo> = containers
            .values()
            .filter(|c| self.codec.decode(&c.name).is_ok())
            .cloned()
            .collect();
        managed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(managed)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let containers = self.containers.read().await;
        containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                container: id.to_string(),
                reason: "container not found".to_string(),
            })
    }
}
