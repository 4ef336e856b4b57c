//! Derived container mapping records

use serde::{Deserialize, Serialize};

/// One row of the `publicPort -> backing container` relation
///
/// Derived solely from the container runtime; the runtime stays the system of
/// record and these records are rebuilt whenever the cache misses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMapping {
    /// Host port advertised to external callers
    pub public_port: u16,
    /// Host port this replica's container is bound to
    pub docker_port: u16,
    /// Full container id
    pub container_id: String,
    /// Service the container backs
    pub service_name: String,
}
