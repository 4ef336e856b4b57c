//! Specification validation errors

use thiserror::Error;

/// Errors produced while validating a [`crate::ServiceSpec`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// Service name is empty or not DNS-safe
    #[error("invalid service name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Image or tag is empty
    #[error("invalid image reference: {0}")]
    InvalidImage(String),

    /// Port outside 1..=65535
    #[error("invalid {field} port {value}: must be in 1..=65535")]
    InvalidPort { field: &'static str, value: i64 },

    /// Volume mount with an empty source or destination
    #[error("invalid volume mount: {0}")]
    InvalidVolume(String),
}

pub type Result<T, E = SpecError> = std::result::Result<T, E>;
