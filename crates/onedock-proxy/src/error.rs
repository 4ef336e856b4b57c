//! Proxy error types

use thiserror::Error;

/// Errors that can occur in the proxy fleet
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the public port
    #[error("failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    /// No running containers back the public port
    #[error("no containers found for port {public_port}")]
    NoBackends { public_port: u16 },

    /// The upstream container did not answer
    #[error("backend {backend} is unavailable: {reason}")]
    UpstreamFailed { backend: String, reason: String },

    /// Backend resolution through the mapping source failed
    #[error("failed to resolve backends: {0}")]
    BackendResolution(String),

    /// One or more proxies failed to stop during shutdown
    #[error("shutdown errors: {0}")]
    ShutdownFailed(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper error
    #[error("http error: {0}")]
    Hyper(#[from] hyper::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status this error maps to at request time
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            ProxyError::NoBackends { .. } => http::StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamFailed { .. } => http::StatusCode::BAD_GATEWAY,
            _ => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = ProxyError::NoBackends { public_port: 9203 };
        assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);

        let err = ProxyError::UpstreamFailed {
            backend: "abc123".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
    }
}
