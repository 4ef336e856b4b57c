//! Docker-based container runtime using bollard
//!
//! Connects to the local Docker daemon and implements the
//! [`ContainerRuntime`] port. Containers are named through the
//! [`NameCodec`] and labeled so their spec can be partially rebuilt after a
//! daemon restart.

use crate::env;
use crate::error::{Result, RuntimeError};
use crate::naming::NameCodec;
use crate::runtime::{ContainerInfo, ContainerRuntime, PortBindingInfo};
use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, HostConfig, HostConfigLogConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use onedock_spec::ServiceSpec;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Substrings the daemon uses when a host port bind conflicts
const PORT_CONFLICT_MARKERS: [&str; 2] = ["port is already allocated", "address already in use"];

/// Docker runtime adapter
pub struct DockerRuntime {
    docker: Docker,
    codec: NameCodec,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("prefix", &self.codec.prefix())
            .finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using platform defaults
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon is unreachable or the verification
    /// ping fails.
    pub async fn new(codec: NameCodec) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Internal(format!("failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Internal(format!("Docker ping failed: {}", e)))?;

        tracing::info!(prefix = %codec.prefix(), "connected to Docker daemon");
        Ok(Self { docker, codec })
    }

    /// Wrap a pre-configured bollard client
    pub fn with_client(docker: Docker, codec: NameCodec) -> Self {
        Self { docker, codec }
    }
}

/// Build the container environment: env-file first, inline wins on conflict
fn build_env(spec: &ServiceSpec) -> Result<Vec<String>> {
    let file_vars = match &spec.env_file {
        Some(path) => env::read_env_file(Path::new(path))?,
        None => HashMap::new(),
    };
    let merged = env::merge_env(file_vars, &spec.environment);

    Ok(merged
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect())
}

/// Build volume binds in `source:destination[:ro]` form
fn build_binds(spec: &ServiceSpec) -> Vec<String> {
    spec.volumes
        .iter()
        .map(|volume| {
            let mut bind = format!("{}:{}", volume.source, volume.destination);
            if volume.read_only {
                bind.push_str(":ro");
            }
            bind
        })
        .collect()
}

/// Build the management labels written on every container
fn build_labels(codec: &NameCodec, spec: &ServiceSpec) -> HashMap<String, String> {
    HashMap::from([
        (codec.label("managed"), "true".to_string()),
        (codec.label("service"), spec.name.clone()),
        (codec.label("image"), spec.image.clone()),
        (codec.label("tag"), spec.tag.clone()),
        (codec.label("public_port"), spec.public_port.to_string()),
    ])
}

/// Build the host configuration for one replica
///
/// The binding is deliberately on `0.0.0.0`: the reverse proxy reaches the
/// container over the host loopback.
fn build_host_config(spec: &ServiceSpec, docker_port: u16) -> HostConfig {
    let key = format!("{}/tcp", spec.internal_port);
    let binding = PortBinding {
        host_ip: Some("0.0.0.0".to_string()),
        host_port: Some(docker_port.to_string()),
    };
    let port_bindings = HashMap::from([(key, Some(vec![binding]))]);

    let binds = build_binds(spec);

    // Restart policy only on Linux; Docker Desktop VMs handle restarts poorly
    let restart_policy = if cfg!(target_os = "linux") {
        Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        })
    } else {
        None
    };

    HostConfig {
        port_bindings: Some(port_bindings),
        binds: if binds.is_empty() { None } else { Some(binds) },
        restart_policy,
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(HashMap::from([
                ("max-size".to_string(), "10m".to_string()),
                ("max-file".to_string(), "3".to_string()),
            ])),
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str, tag: &str) -> Result<()> {
        let image_ref = format!("{}:{}", image, tag);
        tracing::info!(image = %image_ref, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::PullFailed {
                        image: image_ref,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(image = %image_ref, "image pulled");
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

        let env = build_env(spec)?;
        let labels = build_labels(&self.codec, spec);
        let host_config = build_host_config(spec, docker_port);

        let body = ContainerCreateBody {
            image: Some(spec.image_ref()),
            env: if env.is_empty() { None } else { Some(env) },
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            entrypoint: if spec.entrypoint.is_empty() {
                None
            } else {
                Some(spec.entrypoint.clone())
            },
            working_dir: spec.working_dir.clone(),
            exposed_ports: Some(vec![format!("{}/tcp", spec.internal_port)]),
            labels: Some(labels),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            platform: String::new(),
        };

        tracing::info!(
            container = %name,
            image = %spec.image_ref(),
            docker_port = docker_port,
            "creating container"
        );

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| {
                let reason = e.to_string();
                if PORT_CONFLICT_MARKERS.iter().any(|m| reason.contains(m)) {
                    RuntimeError::PortInUse { port: docker_port }
                } else {
                    RuntimeError::CreateFailed {
                        name: name.clone(),
                        reason,
                    }
                }
            })?;

        tracing::info!(container = %name, id = %&response.id[..12.min(response.id.len())], "container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        tracing::info!(container = %id, "starting container");

        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        tracing::info!(container = %id, timeout = ?timeout, "stopping container");

        let options = StopContainerOptions {
            t: Some(timeout.as_secs() as i32),
            signal: None,
        };

        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::StopFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        tracing::info!(container = %id, "removing container");

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::RemoveFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Internal(format!("failed to list containers: {}", e)))?;

        let mut result = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();

            // Managed containers only
            if self.codec.decode(&name).is_err() {
                continue;
            }

            let ports = summary
                .ports
                .unwrap_or_default()
                .into_iter()
                .filter_map(|port| {
                    port.public_port.map(|public| PortBindingInfo {
                        host_port: public,
                        container_port: port.private_port,
                        protocol: port
                            .typ
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "tcp".to_string()),
                    })
                })
                .collect();

            result.push(ContainerInfo {
                id: summary.id.unwrap_or_default(),
                name,
                image: summary.image.unwrap_or_default(),
                state: summary
                    .state
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                status: summary.status.unwrap_or_default(),
                ports,
                labels: summary.labels.unwrap_or_default(),
                created_at: summary.created,
            });
        }

        Ok(result)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| RuntimeError::NotFound {
                container: id.to_string(),
                reason: e.to_string(),
            })?;

        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        self.codec.decode(&name)?;

        let mut ports = Vec::new();
        if let Some(port_map) = inspect.network_settings.and_then(|n| n.ports) {
            for (container_port, bindings) in port_map {
                let container_port: u16 = container_port
                    .split('/')
                    .next()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_default();
                for binding in bindings.unwrap_or_default() {
                    if let Some(host_port) = binding.host_port.and_then(|p| p.parse().ok()) {
                        ports.push(PortBindingInfo {
                            host_port,
                            container_port,
                            protocol: "tcp".to_string(),
                        });
                    }
                }
            }
        }

        let state = inspect
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();

        let created_at = inspect
            .created
            .as_deref()
            .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
            .map(|t| t.timestamp());

        let config = inspect.config.unwrap_or_default();

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name,
            image: config.image.unwrap_or_default(),
            status: state.clone(),
            state,
            ports,
            labels: config.labels.unwrap_or_default(),
            created_at,
        })
    }
}
