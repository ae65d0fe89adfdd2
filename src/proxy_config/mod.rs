//! Sidecar configuration generation.
//!
//! [`ProxyConfigGenerator`] snapshots the registry into one bootstrap
//! document per service plus two resource-list documents that the sidecar
//! polls for listener and cluster updates.

pub mod envoy;
mod generator;

pub use envoy::Bootstrap;
pub use generator::{
    ChangeListenerId, GenerateOptions, ProxyConfigGenerator, ProxyConfigOptions, RefreshReport,
};
