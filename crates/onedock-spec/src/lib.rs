//! Service specification and shared models for onedock
//!
//! This crate provides the types exchanged between the management surface,
//! the replica manager and the proxy fleet: the caller-supplied
//! [`ServiceSpec`], the derived [`ContainerMapping`], and the read-only
//! service views returned by list/status operations.

mod error;
mod mapping;
mod types;
mod views;

pub use error::*;
pub use mapping::*;
pub use types::*;
pub use views::*;
