//! Container runtime adapter and replica lifecycle for onedock
//!
//! This crate owns everything that talks to the container runtime: the name
//! codec that makes container names the cross-restart system of record, host
//! port allocation, the [`ContainerRuntime`] port with its Docker adapter,
//! and the [`ReplicaManager`] that drives deploy/scale/rolling-update.

mod docker;
pub mod env;
mod error;
mod naming;
mod ports;
mod replicas;
mod runtime;

pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use naming::{ContainerName, NameCodec};
pub use ports::PortAllocator;
pub use replicas::ReplicaManager;
pub use runtime::{ContainerInfo, ContainerRuntime, MockRuntime, PortBindingInfo};
