//! Backends and load balancing
//!
//! A [`Backend`] is one reverse-proxy target; a [`LoadBalancer`] selects
//! among an immutable snapshot of backends. Snapshots are replaced wholesale
//! when the owning proxy is rebuilt, never mutated while serving.

use onedock_spec::ContainerMapping;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default backend weight for weighted balancing
const DEFAULT_WEIGHT: u32 = 100;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
}

impl BalanceStrategy {
    /// Parse a configured strategy name; unknown values degrade to
    /// round-robin with a warning.
    pub fn parse(value: &str) -> Self {
        match value {
            "round_robin" | "" => BalanceStrategy::RoundRobin,
            "least_connections" => BalanceStrategy::LeastConnections,
            "weighted" => BalanceStrategy::Weighted,
            other => {
                tracing::warn!(
                    strategy = %other,
                    "unknown load balance strategy, falling back to round_robin"
                );
                BalanceStrategy::RoundRobin
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceStrategy::RoundRobin => "round_robin",
            BalanceStrategy::LeastConnections => "least_connections",
            BalanceStrategy::Weighted => "weighted",
        }
    }
}

/// One reverse-proxy target backed by a running container
#[derive(Debug)]
pub struct Backend {
    mapping: ContainerMapping,
    active: AtomicBool,
    connections: AtomicI64,
    weight: u32,
    /// Unix millis of the last request routed here
    last_used_ms: AtomicU64,
}

impl Backend {
    pub fn new(mapping: ContainerMapping) -> Self {
        Self {
            mapping,
            active: AtomicBool::new(true),
            connections: AtomicI64::new(0),
            weight: DEFAULT_WEIGHT,
            last_used_ms: AtomicU64::new(now_ms()),
        }
    }

    pub fn with_weight(mapping: ContainerMapping, weight: u32) -> Self {
        Self {
            weight,
            ..Self::new(mapping)
        }
    }

    pub fn mapping(&self) -> &ContainerMapping {
        &self.mapping
    }

    /// Upstream address on the host loopback
    pub fn target_authority(&self) -> String {
        format!("localhost:{}", self.mapping.docker_port)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Flip the liveness flag. Liveness is re-derived from the runtime on the
    /// next rebuild; this only gates selection until then.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    /// Record a request landing on this backend
    pub fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// RAII guard tracking one in-flight request against a backend
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn new(backend: Arc<Backend>) -> Self {
        backend.connections.fetch_add(1, Ordering::Relaxed);
        Self { backend }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Selects a backend per request over an immutable snapshot
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: BalanceStrategy,
    backends: Vec<Arc<Backend>>,
    cursor: AtomicU64,
}

impl LoadBalancer {
    pub fn new(strategy: BalanceStrategy, backends: Vec<Arc<Backend>>) -> Self {
        Self {
            strategy,
            backends,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Select a backend for the next request, or `None` when no backend is
    /// active. Safe under concurrent calls from many request handlers.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let active: Vec<&Arc<Backend>> =
            self.backends.iter().filter(|b| b.is_active()).collect();
        if active.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            BalanceStrategy::RoundRobin => self.select_round_robin(&active),
            BalanceStrategy::LeastConnections => self.select_least_connections(&active),
            BalanceStrategy::Weighted => self.select_weighted(&active),
        };

        Some(Arc::clone(selected))
    }

    fn select_round_robin<'a>(&self, active: &[&'a Arc<Backend>]) -> &'a Arc<Backend> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % active.len();
        active[index]
    }

    fn select_least_connections<'a>(&self, active: &[&'a Arc<Backend>]) -> &'a Arc<Backend> {
        active
            .iter()
            .min_by_key(|b| b.connection_count())
            .expect("active is non-empty")
    }

    fn select_weighted<'a>(&self, active: &[&'a Arc<Backend>]) -> &'a Arc<Backend> {
        let total: u64 = active.iter().map(|b| b.weight() as u64).sum();
        if total == 0 {
            return self.select_round_robin(active);
        }

        let target = rand::rng().random_range(0..total);
        let mut cumulative = 0u64;
        for backend in active {
            cumulative += backend.weight() as u64;
            if cumulative > target {
                return backend;
            }
        }
        active[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn mapping(docker_port: u16) -> ContainerMapping {
        ContainerMapping {
            public_port: 9203,
            docker_port,
            container_id: format!("container-{docker_port}"),
            service_name: "web".to_string(),
        }
    }

    fn backends(ports: &[u16]) -> Vec<Arc<Backend>> {
        ports
            .iter()
            .map(|p| Arc::new(Backend::new(mapping(*p))))
            .collect()
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            BalanceStrategy::parse("round_robin"),
            BalanceStrategy::RoundRobin
        );
        assert_eq!(
            BalanceStrategy::parse("least_connections"),
            BalanceStrategy::LeastConnections
        );
        assert_eq!(BalanceStrategy::parse("weighted"), BalanceStrategy::Weighted);
    }

    #[test]
    fn test_unknown_strategy_degrades_to_round_robin() {
        assert_eq!(
            BalanceStrategy::parse("ip_hash"),
            BalanceStrategy::RoundRobin
        );
    }

    #[test]
    fn test_round_robin_distribution() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin, backends(&[30000, 30001, 30002]));

        let mut counts: HashMap<u16, u32> = HashMap::new();
        for _ in 0..9 {
            let backend = lb.select().unwrap();
            *counts.entry(backend.mapping().docker_port).or_default() += 1;
        }

        // 9 requests over 3 backends: exactly 3 each
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 3));
    }

    #[test]
    fn test_select_none_when_all_inactive() {
        let list = backends(&[30000, 30001]);
        for backend in &list {
            backend.set_active(false);
        }
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin, list);
        assert!(lb.select().is_none());
    }

    #[test]
    fn test_inactive_backend_skipped() {
        let list = backends(&[30000, 30001]);
        list[0].set_active(false);
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin, list);

        for _ in 0..4 {
            assert_eq!(lb.select().unwrap().mapping().docker_port, 30001);
        }
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let list = backends(&[30000, 30001]);
        let _busy1 = ConnectionGuard::new(list[0].clone());
        let _busy2 = ConnectionGuard::new(list[0].clone());

        let lb = LoadBalancer::new(BalanceStrategy::LeastConnections, list);
        assert_eq!(lb.select().unwrap().mapping().docker_port, 30001);
    }

    #[test]
    fn test_connection_guard_counts() {
        let backend = Arc::new(Backend::new(mapping(30000)));
        assert_eq!(backend.connection_count(), 0);
        {
            let _g1 = ConnectionGuard::new(backend.clone());
            let _g2 = ConnectionGuard::new(backend.clone());
            assert_eq!(backend.connection_count(), 2);
        }
        assert_eq!(backend.connection_count(), 0);
    }

    #[test]
    fn test_weighted_share_approaches_ratio() {
        let light = Arc::new(Backend::with_weight(mapping(30000), 1));
        let heavy = Arc::new(Backend::with_weight(mapping(30001), 3));
        let lb = LoadBalancer::new(BalanceStrategy::Weighted, vec![light, heavy]);

        let mut heavy_hits = 0u32;
        let samples = 4000;
        for _ in 0..samples {
            if lb.select().unwrap().mapping().docker_port == 30001 {
                heavy_hits += 1;
            }
        }

        // Expected share is 75%; allow a generous band for randomness
        let share = heavy_hits as f64 / samples as f64;
        assert!((0.68..0.82).contains(&share), "share was {share}");
    }

    #[test]
    fn test_weighted_zero_total_degrades_to_round_robin() {
        let list = vec![
            Arc::new(Backend::with_weight(mapping(30000), 0)),
            Arc::new(Backend::with_weight(mapping(30001), 0)),
        ];
        let lb = LoadBalancer::new(BalanceStrategy::Weighted, list);

        let first = lb.select().unwrap().mapping().docker_port;
        let second = lb.select().unwrap().mapping().docker_port;
        assert_ne!(first, second);
    }
}
