//! Service orchestration facade for onedock
//!
//! Couples the replica manager, the mapping cache and the proxy fleet behind
//! one [`ServiceOrchestrator`] the management surface talks to.

mod cache;
mod error;
mod orchestrator;

pub use cache::MappingCache;
pub use error::{OrchestratorError, Result};
pub use orchestrator::ServiceOrchestrator;
