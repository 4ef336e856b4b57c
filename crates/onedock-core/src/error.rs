//! Orchestration errors

use onedock_proxy::ProxyError;
use onedock_runtime::RuntimeError;
use onedock_spec::SpecError;
use thiserror::Error;

/// Errors surfaced by the orchestration facade
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The supplied spec failed validation; no state was changed
    #[error(transparent)]
    Validation(#[from] SpecError),

    /// Replica or runtime operation failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Proxy fleet operation failed
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl OrchestratorError {
    /// Whether this error means the named service does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Runtime(RuntimeError::ServiceNotFound { .. })
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
