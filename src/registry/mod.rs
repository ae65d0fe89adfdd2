//! Service registry client and the coordination-store boundary it talks to.
//!
//! [`ServiceRegistryClient`] owns the mesh-facing semantics (validation,
//! id defaulting, script-check polling, passing-only filtering) and delegates
//! storage to a [`RegistryBackend`]. Two backends ship with the crate:
//! [`ConsulBackend`] for a real Consul agent and [`InMemoryRegistry`] for
//! tests and local development.

mod client;
mod consul;
mod memory;
pub mod model;
mod script;

pub use client::{RegistrationResult, RegistryClientConfig, ServiceRegistryClient};
pub use consul::{ConsulBackend, ConsulConfig};
pub use memory::InMemoryRegistry;
pub use model::{
    parse_interval, AgentService, CheckDefinition, CheckStatus, HealthCheckSpec, HealthState,
    InstanceHealth, Registration, ServiceDescriptor, ServiceInstance,
};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Coordination-store API consumed by the registry client.
///
/// Any store exposing this shape is substitutable.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Registers (or re-registers) an instance.
    async fn register(&self, registration: &Registration) -> Result<()>;

    /// Removes an instance. Returns `false` when the id was unknown.
    async fn deregister(&self, id: &str) -> Result<bool>;

    /// Instances of `service`, optionally restricted to those with every check passing.
    async fn health(&self, service: &str, passing_only: bool) -> Result<Vec<ServiceInstance>>;

    /// Instances registered with the local agent, keyed by instance id.
    async fn agent_services(&self) -> Result<BTreeMap<String, AgentService>>;

    /// Address of the current leader; used as a connectivity check.
    async fn leader(&self) -> Result<String>;

    /// Pushes a TTL check result.
    async fn update_check(&self, check_id: &str, status: HealthState, output: &str)
        -> Result<()>;

    /// Names of every service known to the store.
    async fn services(&self) -> Result<Vec<String>>;
}
