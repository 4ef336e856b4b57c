//! Proxy fleet
//!
//! Owns the `publicPort -> PortProxy` map and drives proxy lifecycle in step
//! with replica operations. Backends are resolved through the
//! [`BackendSource`] port so the fleet never talks to the container runtime
//! directly.

use crate::error::{ProxyError, Result};
use crate::lb::{Backend, BalanceStrategy, LoadBalancer};
use crate::proxy::{PortProxy, PortProxyStats, ProxyMode};
use async_trait::async_trait;
use onedock_spec::ContainerMapping;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Pause between stop and re-start of a port so the kernel releases the
/// listener. The port is briefly unreachable during this window.
const PORT_RELEASE_PAUSE: Duration = Duration::from_millis(100);

/// Bound on stopping the whole fleet at shutdown
const FLEET_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the fleet gets its view of `publicPort -> containers`
///
/// Implemented by the mapping cache; the cache in turn rebuilds from the
/// container runtime on miss.
#[async_trait]
pub trait BackendSource: Send + Sync {
    /// Mappings of the running containers behind one public port
    async fn backends_for(&self, public_port: u16) -> Result<Vec<ContainerMapping>>;

    /// Public ports that currently have at least one replica, for recovery
    async fn active_public_ports(&self) -> Result<Vec<u16>>;
}

/// Fleet-level counters returned by [`ProxyFleet::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct FleetStats {
    pub total_proxies: usize,
    pub single_proxies: usize,
    pub load_balancers: usize,
    pub proxies: Vec<PortProxyStats>,
}

/// Outcome of a recovery scan
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverReport {
    pub succeeded: u32,
    pub failed: u32,
}

/// The set of per-public-port listeners this daemon owns
pub struct ProxyFleet {
    source: Arc<dyn BackendSource>,
    strategy: BalanceStrategy,
    proxies: RwLock<HashMap<u16, Arc<PortProxy>>>,
}

impl ProxyFleet {
    pub fn new(source: Arc<dyn BackendSource>, strategy: BalanceStrategy) -> Self {
        Self {
            source,
            strategy,
            proxies: RwLock::new(HashMap::new()),
        }
    }

    /// Start a proxy for a public port; no-op if one is already bound
    ///
    /// Backends are resolved before the map lock is taken, so the lock is
    /// never held across runtime I/O.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NoBackends`] when no running container backs the port,
    /// [`ProxyError::BindFailed`] when the port cannot be bound.
    pub async fn start(&self, public_port: u16) -> Result<()> {
        if self.proxies.read().await.contains_key(&public_port) {
            debug!(port = public_port, "proxy already running");
            return Ok(());
        }

        let mappings = self.source.backends_for(public_port).await?;
        if mappings.is_empty() {
            return Err(ProxyError::NoBackends { public_port });
        }

        let proxy = build_proxy(public_port, mappings, self.strategy);

        let mut proxies = self.proxies.write().await;
        if proxies.contains_key(&public_port) {
            // Lost the race to another starter; theirs is already serving
            return Ok(());
        }

        proxy.start().await?;
        info!(
            port = public_port,
            mode = proxy.mode().as_str(),
            "proxy started"
        );
        proxies.insert(public_port, Arc::new(proxy));
        Ok(())
    }

    /// Stop and forget the proxy on a public port; no-op if absent
    pub async fn stop(&self, public_port: u16) {
        let removed = self.proxies.write().await.remove(&public_port);
        match removed {
            Some(proxy) => {
                proxy.stop().await;
                info!(port = public_port, "proxy removed");
            }
            None => {
                debug!(port = public_port, "no proxy to stop");
            }
        }
    }

    /// Rebuild the proxy on a public port against the current replica set
    ///
    /// Stop, short pause for the kernel to release the socket, start. The
    /// port is briefly unavailable; that is the accepted trade-off over a
    /// listener hand-off.
    pub async fn update(&self, public_port: u16) -> Result<()> {
        self.stop(public_port).await;
        tokio::time::sleep(PORT_RELEASE_PAUSE).await;
        self.start(public_port).await
    }

    /// Restart proxies for every public port with live replicas
    ///
    /// Run at daemon boot; failures are logged and counted, never fatal.
    pub async fn recover(&self) -> RecoverReport {
        info!("recovering proxies from runtime state");

        let ports = match self.source.active_public_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                error!(error = %e, "failed to enumerate services for recovery");
                return RecoverReport::default();
            }
        };

        let mut report = RecoverReport::default();
        for port in ports {
            match self.start(port).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(port, error = %e, "proxy recovery failed");
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "proxy recovery finished"
        );
        report
    }

    /// Stop every proxy and clear the map
    ///
    /// # Errors
    ///
    /// [`ProxyError::ShutdownFailed`] when the fleet does not stop within 10
    /// seconds; remaining listeners die with the process.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(u16, Arc<PortProxy>)> =
            self.proxies.write().await.drain().collect();

        let stop_all = async {
            for (port, proxy) in &drained {
                debug!(port, "stopping proxy for shutdown");
                proxy.stop().await;
            }
        };

        if tokio::time::timeout(FLEET_SHUTDOWN_TIMEOUT, stop_all)
            .await
            .is_err()
        {
            return Err(ProxyError::ShutdownFailed(format!(
                "fleet did not stop within {:?}",
                FLEET_SHUTDOWN_TIMEOUT
            )));
        }

        info!("all proxies shut down");
        Ok(())
    }

    /// Snapshot of counts and per-port detail
    pub async fn stats(&self) -> FleetStats {
        let proxies = self.proxies.read().await;

        let mut stats = FleetStats {
            total_proxies: proxies.len(),
            single_proxies: 0,
            load_balancers: 0,
            proxies: Vec::with_capacity(proxies.len()),
        };

        for proxy in proxies.values() {
            match proxy.mode() {
                ProxyMode::Single => stats.single_proxies += 1,
                ProxyMode::Balanced => stats.load_balancers += 1,
            }
            stats.proxies.push(proxy.stats());
        }

        stats.proxies.sort_by_key(|p| p.public_port);
        stats
    }

    /// Whether a proxy is currently bound to the port
    pub async fn is_running(&self, public_port: u16) -> bool {
        self.proxies.read().await.contains_key(&public_port)
    }
}

/// Single-target proxy for one backing container, balanced otherwise
fn build_proxy(
    public_port: u16,
    mappings: Vec<ContainerMapping>,
    strategy: BalanceStrategy,
) -> PortProxy {
    let mut backends: Vec<Arc<Backend>> = mappings
        .into_iter()
        .map(|mapping| Arc::new(Backend::new(mapping)))
        .collect();

    if backends.len() == 1 {
        PortProxy::single(public_port, backends.remove(0))
    } else {
        PortProxy::balanced(public_port, LoadBalancer::new(strategy, backends))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed in-memory backend source
    struct StaticSource {
        mappings: RwLock<HashMap<u16, Vec<ContainerMapping>>>,
    }

    impl StaticSource {
        fn new() -> Self {
            Self {
                mappings: RwLock::new(HashMap::new()),
            }
        }

        async fn set(&self, public_port: u16, docker_ports: &[u16]) {
            let mappings = docker_ports
                .iter()
                .map(|p| ContainerMapping {
                    public_port,
                    docker_port: *p,
                    container_id: format!("container-{p}"),
                    service_name: "web".to_string(),
                })
                .collect();
            self.mappings.write().await.insert(public_port, mappings);
        }
    }

    #[async_trait]
    impl BackendSource for StaticSource {
        async fn backends_for(&self, public_port: u16) -> Result<Vec<ContainerMapping>> {
            Ok(self
                .mappings
                .read()
                .await
                .get(&public_port)
                .cloned()
                .unwrap_or_default())
        }

        async fn active_public_ports(&self) -> Result<Vec<u16>> {
            let mut ports: Vec<u16> = self
                .mappings
                .read()
                .await
                .iter()
                .filter(|(_, mappings)| !mappings.is_empty())
                .map(|(port, _)| *port)
                .collect();
            ports.sort_unstable();
            Ok(ports)
        }
    }

    /// Grab a free port from the OS for tests that really bind
    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fleet_with(source: Arc<StaticSource>) -> ProxyFleet {
        ProxyFleet::new(source, BalanceStrategy::RoundRobin)
    }

    #[tokio::test]
    async fn test_start_with_no_backends_fails() {
        let source = Arc::new(StaticSource::new());
        let fleet = fleet_with(source);

        let result = fleet.start(free_port()).await;
        assert!(matches!(result, Err(ProxyError::NoBackends { .. })));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let source = Arc::new(StaticSource::new());
        let port = free_port();
        source.set(port, &[30000]).await;

        let fleet = fleet_with(source);
        fleet.start(port).await.unwrap();
        fleet.start(port).await.unwrap();

        let stats = fleet.stats().await;
        assert_eq!(stats.total_proxies, 1);
        assert_eq!(stats.single_proxies, 1);

        fleet.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mode_follows_backend_count() {
        let source = Arc::new(StaticSource::new());
        let single_port = free_port();
        let balanced_port = free_port();
        source.set(single_port, &[30000]).await;
        source.set(balanced_port, &[30001, 30002, 30003]).await;

        let fleet = fleet_with(source);
        fleet.start(single_port).await.unwrap();
        fleet.start(balanced_port).await.unwrap();

        let stats = fleet.stats().await;
        assert_eq!(stats.total_proxies, 2);
        assert_eq!(stats.single_proxies, 1);
        assert_eq!(stats.load_balancers, 1);

        let balanced = stats
            .proxies
            .iter()
            .find(|p| p.public_port == balanced_port)
            .unwrap();
        assert_eq!(balanced.mode, "balanced");
        assert_eq!(balanced.backend_count, Some(3));
        assert_eq!(balanced.strategy, Some("round_robin"));

        fleet.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_switches_mode() {
        let source = Arc::new(StaticSource::new());
        let port = free_port();
        source.set(port, &[30000]).await;

        let fleet = fleet_with(source.clone());
        fleet.start(port).await.unwrap();
        assert_eq!(fleet.stats().await.single_proxies, 1);

        // Scale out: same port now has three backends
        source.set(port, &[30000, 30001, 30002]).await;
        fleet.update(port).await.unwrap();

        let stats = fleet.stats().await;
        assert_eq!(stats.total_proxies, 1);
        assert_eq!(stats.load_balancers, 1);

        fleet.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_removes_proxy() {
        let source = Arc::new(StaticSource::new());
        let port = free_port();
        source.set(port, &[30000]).await;

        let fleet = fleet_with(source);
        fleet.start(port).await.unwrap();
        assert!(fleet.is_running(port).await);

        fleet.stop(port).await;
        assert!(!fleet.is_running(port).await);
        assert_eq!(fleet.stats().await.total_proxies, 0);

        // Stopping again is a no-op
        fleet.stop(port).await;
    }

    #[tokio::test]
    async fn test_recover_starts_all_active_ports() {
        let source = Arc::new(StaticSource::new());
        let port_a = free_port();
        let port_b = free_port();
        source.set(port_a, &[30000, 30001]).await;
        source.set(port_b, &[30002]).await;

        let fleet = fleet_with(source);
        let report = fleet.recover().await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert!(fleet.is_running(port_a).await);
        assert!(fleet.is_running(port_b).await);

        fleet.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let source = Arc::new(StaticSource::new());
        let port_a = free_port();
        let port_b = free_port();
        source.set(port_a, &[30000]).await;
        source.set(port_b, &[30001]).await;

        let fleet = fleet_with(source);
        fleet.start(port_a).await.unwrap();
        fleet.start(port_b).await.unwrap();

        fleet.shutdown().await.unwrap();
        assert_eq!(fleet.stats().await.total_proxies, 0);
    }
}
