//! Runtime and replica lifecycle errors

use thiserror::Error;

/// Errors from the container runtime adapter and the replica manager
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Container name does not carry the managed prefix
    #[error("container '{name}' is not managed by this orchestrator")]
    NotManaged { name: String },

    /// Container name carries the prefix but does not match the grammar
    #[error("container name '{name}' does not match the expected format")]
    MalformedName { name: String },

    /// Container lacks the labels needed to rebuild a spec
    #[error("container '{container}' is missing required labels")]
    MissingLabels { container: String },

    /// Failed to pull image
    #[error("failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    /// Failed to create container
    #[error("failed to create container '{name}': {reason}")]
    CreateFailed { name: String, reason: String },

    /// Failed to start container
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Failed to stop container
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Failed to remove container
    #[error("failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    /// Container not found
    #[error("container '{container}' not found: {reason}")]
    NotFound { container: String, reason: String },

    /// The runtime reported the host port as taken at create time
    #[error("host port {port} is already in use")]
    PortInUse { port: u16 },

    /// No free host port from the configured start
    #[error("no free host port found starting from {start}")]
    ResourceExhausted { start: u16 },

    /// Operation on a service with no containers
    #[error("service '{service}' not found, no containers exist")]
    ServiceNotFound { service: String },

    /// Rolling update replaced zero replicas
    #[error("all replica updates failed for service '{service}'")]
    UpdateFailed { service: String },

    /// Failed to read an env file
    #[error("failed to read env file '{path}': {reason}")]
    EnvFileRead { path: String, reason: String },

    /// Invalid spec
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Internal runtime error
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether this error means the allocated host port was taken after all.
    /// Docker reports the conflict at create or at start depending on the
    /// daemon version, so both shapes are recognized.
    pub fn is_port_conflict(&self) -> bool {
        match self {
            RuntimeError::PortInUse { .. } => true,
            RuntimeError::CreateFailed { reason, .. } | RuntimeError::StartFailed { reason, .. } => {
                reason.contains("port is already allocated")
                    || reason.contains("address already in use")
            }
            _ => false,
        }
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

