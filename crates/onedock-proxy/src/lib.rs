//! Per-port reverse proxy fleet for onedock
//!
//! Each public port gets one listening socket fronting the replicas that
//! back it: directly for a single replica, through a load balancer for
//! several. The fleet tears proxies up and down in step with replica
//! lifecycle operations and recovers them from runtime state at boot.

mod error;
mod fleet;
mod lb;
mod proxy;

pub use error::{ProxyError, Result};
pub use fleet::{BackendSource, FleetStats, ProxyFleet, RecoverReport};
pub use lb::{Backend, BalanceStrategy, ConnectionGuard, LoadBalancer};
pub use proxy::{BackendStats, PortProxy, PortProxyStats, ProxyMode};
