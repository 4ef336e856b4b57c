//! Read-only service views returned by list/status operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate service state derived from backing containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Running,
    Stopped,
    Failed,
}

impl ServiceState {
    /// Map a runtime-reported container state string onto the service view
    pub fn from_container_state(state: &str) -> Self {
        match state {
            "running" => ServiceState::Running,
            "created" | "restarting" => ServiceState::Pending,
            "dead" => ServiceState::Failed,
            _ => ServiceState::Stopped,
        }
    }
}

/// Summary view of one managed service, grouped from its containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Short id (first 12 chars of a backing container id)
    pub id: String,
    pub name: String,
    pub image: String,
    pub tag: String,
    pub status: ServiceState,
    pub public_port: u16,
    pub internal_port: u16,
    /// Number of backing containers currently present
    pub replicas: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One replica row inside a [`ServiceStatus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Short id (first 12 chars of the container id)
    pub id: String,
    pub container_id: String,
    pub container_name: String,
    pub service_name: String,
    pub state: String,
    pub public_port: u16,
    pub docker_port: u16,
    pub internal_port: u16,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Populated by an external metrics source; 0 when absent
    pub cpu_usage: f64,
    /// Populated by an external metrics source; 0 when absent
    pub memory_usage: f64,
}

/// Detailed per-replica status of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: Service,
    pub total_replicas: u32,
    pub running_replicas: u32,
    pub stopped_replicas: u32,
    pub instances: Vec<ServiceInstance>,
    /// Configured balancer strategy name
    pub load_balancer: String,
    /// External URL the service answers on
    pub access_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state_mapping() {
        assert_eq!(
            ServiceState::from_container_state("running"),
            ServiceState::Running
        );
        assert_eq!(
            ServiceState::from_container_state("created"),
            ServiceState::Pending
        );
        assert_eq!(
            ServiceState::from_container_state("exited"),
            ServiceState::Stopped
        );
        assert_eq!(
            ServiceState::from_container_state("dead"),
            ServiceState::Failed
        );
    }
}
