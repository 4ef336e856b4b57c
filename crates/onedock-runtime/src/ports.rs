//! Host port allocation for replicas

use crate::error::{Result, RuntimeError};
use crate::naming::NameCodec;
use crate::runtime::ContainerInfo;
use std::collections::HashSet;
use std::net::TcpListener;

/// Picks the next free host port for a new replica
///
/// A port is rejected when any managed container already encodes it as a
/// docker port, when it appears in the exclusion list (public ports must not
/// be reused as docker ports), or when a TCP listen probe on all interfaces
/// fails. The probe is racy against external processes; callers run under the
/// per-service lock and retry create on a runtime-reported port conflict.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start_port: u16,
}

impl PortAllocator {
    pub fn new(start_port: u16) -> Self {
        Self { start_port }
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    /// Find the first free port at or above the configured start
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ResourceExhausted`] when the scan runs off the
    /// end of the port range.
    pub fn allocate(
        &self,
        containers: &[ContainerInfo],
        codec: &NameCodec,
        exclusions: &[u16],
    ) -> Result<u16> {
        let mut used: HashSet<u16> = exclusions.iter().copied().collect();
        for container in containers {
            if let Ok(parsed) = codec.decode(&container.name) {
                used.insert(parsed.docker_port);
            }
        }

        for port in self.start_port..=u16::MAX {
            if used.contains(&port) {
                continue;
            }
            if Self::is_port_occupied(port) {
                continue;
            }
            return Ok(port);
        }

        Err(RuntimeError::ResourceExhausted {
            start: self.start_port,
        })
    }

    /// Probe a port by binding a listener on all interfaces
    fn is_port_occupied(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerInfo;

    fn container_named(name: &str) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_skips_ports_used_by_managed_containers() {
        let codec = NameCodec::new("onedock");
        let containers = vec![
            container_named("onedock-web-p9203-c30000-0"),
            container_named("onedock-web-p9203-c30001-1"),
            container_named("onedock-api-p9100-c30002-0"),
        ];

        let allocator = PortAllocator::new(30000);
        let port = allocator.allocate(&containers, &codec, &[]).unwrap();
        assert_eq!(port, 30003);
    }

    #[test]
    fn test_ignores_unmanaged_containers() {
        let codec = NameCodec::new("onedock");
        let containers = vec![container_named("registry")];

        let allocator = PortAllocator::new(30000);
        let port = allocator.allocate(&containers, &codec, &[]).unwrap();
        assert_eq!(port, 30000);
    }

    #[test]
    fn test_exclusions_are_never_returned() {
        let codec = NameCodec::new("onedock");
        let allocator = PortAllocator::new(30000);
        let port = allocator.allocate(&[], &codec, &[30000, 30001]).unwrap();
        assert_eq!(port, 30002);
    }

    #[test]
    fn test_skips_os_occupied_port() {
        let codec = NameCodec::new("onedock");

        // Hold a port open and start the scan on it
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let held_port = held.local_addr().unwrap().port();

        let allocator = PortAllocator::new(held_port);
        let port = allocator.allocate(&[], &codec, &[]).unwrap();
        assert_ne!(port, held_port);
        assert!(port > held_port);
    }

    #[test]
    fn test_exhaustion_at_range_end() {
        let codec = NameCodec::new("onedock");
        let containers = vec![container_named(&format!(
            "onedock-web-p9203-c{}-0",
            u16::MAX
        ))];

        let allocator = PortAllocator::new(u16::MAX);
        let result = allocator.allocate(&containers, &codec, &[]);
        assert!(matches!(
            result,
            Err(RuntimeError::ResourceExhausted { .. })
        ));
    }
}
