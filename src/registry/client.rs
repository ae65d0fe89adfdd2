//! Mesh-facing registry client.

use super::model::{
    service_check_id, HealthCheckSpec, HealthState, InstanceHealth, Registration,
    ServiceDescriptor, ServiceInstance,
};
use super::script::spawn_script_poller;
use super::{parse_interval, RegistryBackend};
use crate::context::RequestContext;
use crate::error::{MeshError, Result};
use crate::retry::{RetryConfig, RetryExecutor};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Tunables for [`ServiceRegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Backoff for the startup connectivity check.
    pub connect_retry: RetryConfig,
    /// Budget for a single script check run when the check declares none.
    pub script_timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            connect_retry: RetryConfig::default(),
            script_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of [`ServiceRegistryClient::register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub id: String,
}

/// Registers, discovers and health-tracks service instances.
///
/// # Example
///
/// ```no_run
/// use rust_meshplane::context::RequestContext;
/// use rust_meshplane::registry::{InMemoryRegistry, ServiceDescriptor, ServiceRegistryClient};
/// use std::sync::Arc;
///
/// # async fn run() -> rust_meshplane::error::Result<()> {
/// let client = ServiceRegistryClient::new(Arc::new(InMemoryRegistry::new()));
/// let ctx = RequestContext::new();
/// let desc = ServiceDescriptor::new("orders", "1.0.0").with_http_port(8002);
/// let registered = client.register(&ctx, desc).await?;
/// let instances = client.discover(&ctx, "orders", true).await?;
/// assert_eq!(instances[0].id, registered.id);
/// # Ok(())
/// # }
/// ```
pub struct ServiceRegistryClient {
    backend: Arc<dyn RegistryBackend>,
    config: RegistryClientConfig,
    registered: DashMap<String, ServiceDescriptor>,
    pollers: DashMap<String, JoinHandle<()>>,
}

impl ServiceRegistryClient {
    /// Creates a client with default tunables.
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self::with_config(backend, RegistryClientConfig::default())
    }

    pub fn with_config(backend: Arc<dyn RegistryBackend>, config: RegistryClientConfig) -> Self {
        Self {
            backend,
            config,
            registered: DashMap::new(),
            pollers: DashMap::new(),
        }
    }

    /// Verifies the store is reachable, retrying with backoff. Returns the leader address.
    #[instrument(level = "info", skip(self, ctx), fields(correlation_id = %ctx))]
    pub async fn initialize(&self, ctx: &RequestContext) -> Result<String> {
        let mut executor = RetryExecutor::new(self.config.connect_retry.clone());
        let leader = executor
            .execute(|| self.backend.leader())
            .await
            .map_err(|e| {
                warn!("registry connectivity check failed: {}", e);
                e.into_last_error()
            })?;
        info!(leader = %leader, "connected to registry");
        Ok(leader)
    }

    /// Registers an instance. Re-registering an existing id updates it.
    #[instrument(level = "info", skip(self, ctx, descriptor), fields(correlation_id = %ctx, service = %descriptor.name))]
    pub async fn register(
        &self,
        ctx: &RequestContext,
        descriptor: ServiceDescriptor,
    ) -> Result<RegistrationResult> {
        descriptor.validate()?;
        let descriptor = descriptor.with_resolved_id();
        let id = descriptor
            .instance_id()
            .map(String::from)
            .ok_or_else(|| MeshError::Validation("instance id could not be resolved".into()))?;

        let registration = Registration::from_descriptor(&descriptor, &id)?;
        self.backend.register(&registration).await?;

        if let Some(HealthCheckSpec::Script {
            command,
            interval,
            timeout,
        }) = &descriptor.health_check
        {
            let budget = timeout
                .as_deref()
                .map(parse_interval)
                .unwrap_or(self.config.script_timeout);
            let handle = spawn_script_poller(
                Arc::clone(&self.backend),
                id.clone(),
                service_check_id(&id),
                command.clone(),
                parse_interval(interval),
                budget,
            );
            if let Some(previous) = self.pollers.insert(id.clone(), handle) {
                previous.abort();
            }
        } else if let Some((_, previous)) = self.pollers.remove(&id) {
            previous.abort();
        }

        info!(id = %id, "service instance registered");
        self.registered.insert(id.clone(), descriptor);
        Ok(RegistrationResult { success: true, id })
    }

    /// Deregisters an instance and stops its local script check.
    #[instrument(level = "info", skip(self, ctx), fields(correlation_id = %ctx))]
    pub async fn deregister(&self, ctx: &RequestContext, id: &str) -> Result<bool> {
        if let Some((_, poller)) = self.pollers.remove(id) {
            poller.abort();
        }
        let local = self.registered.remove(id).is_some();
        let remote = self.backend.deregister(id).await?;
        info!(id, remote, "service instance deregistered");
        Ok(local || remote)
    }

    /// Instances of `name`; `passing_only` drops any instance with a failing check.
    #[instrument(level = "debug", skip(self, ctx), fields(correlation_id = %ctx))]
    pub async fn discover(
        &self,
        ctx: &RequestContext,
        name: &str,
        passing_only: bool,
    ) -> Result<Vec<ServiceInstance>> {
        let mut instances = self.backend.health(name, passing_only).await?;
        if passing_only {
            instances.retain(|i| i.passing);
        }
        debug!(count = instances.len(), "discovered instances");
        Ok(instances)
    }

    /// Pushes a pass/fail result for an instance's TTL check.
    ///
    /// Returns `false` when the registry has no such check.
    #[instrument(level = "debug", skip(self, ctx, output), fields(correlation_id = %ctx))]
    pub async fn update_health_check(
        &self,
        ctx: &RequestContext,
        id: &str,
        passing: bool,
        output: &str,
    ) -> Result<bool> {
        let status = if passing {
            HealthState::Passing
        } else {
            HealthState::Critical
        };
        match self
            .backend
            .update_check(&service_check_id(id), status, output)
            .await
        {
            Ok(()) => Ok(true),
            Err(MeshError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Per-instance health of `name`, including every check.
    pub async fn get_service_health(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Vec<InstanceHealth>> {
        Ok(self
            .discover(ctx, name, false)
            .await?
            .iter()
            .map(InstanceHealth::from_instance)
            .collect())
    }

    /// Descriptor for `name`: the local registration if any, else rebuilt from the agent.
    ///
    /// With several instances of `name` the one with the smallest id wins, on
    /// both paths, so repeated calls describe the same instance.
    pub async fn get_service_info(
        &self,
        _ctx: &RequestContext,
        name: &str,
    ) -> Result<Option<ServiceDescriptor>> {
        let local = self
            .registered
            .iter()
            .filter(|entry| entry.value().name == name)
            .min_by(|a, b| a.key().cmp(b.key()))
            .map(|entry| entry.value().clone());
        if local.is_some() {
            return Ok(local);
        }
        // keyed by instance id, so the first match is the smallest id
        let services = self.backend.agent_services().await?;
        Ok(services
            .values()
            .find(|s| s.service == name)
            .map(ServiceDescriptor::from_agent_service))
    }

    /// Names of every service the registry knows.
    pub async fn list_services(&self, _ctx: &RequestContext) -> Result<Vec<String>> {
        self.backend.services().await
    }

    /// Descriptors registered through this client, sorted by id.
    pub fn registered_services(&self) -> Vec<ServiceDescriptor> {
        let mut out: Vec<ServiceDescriptor> =
            self.registered.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Polls passing-only discovery until an instance appears or `wait` elapses.
    pub async fn wait_for_service(
        &self,
        ctx: &RequestContext,
        name: &str,
        wait: Duration,
        poll_every: Duration,
    ) -> Result<Vec<ServiceInstance>> {
        let started = Instant::now();
        loop {
            match self.discover(ctx, name, true).await {
                Ok(instances) if !instances.is_empty() => return Ok(instances),
                Ok(_) => {}
                Err(e) => debug!(service = name, error = %e, "discovery failed while waiting"),
            }
            if started.elapsed() >= wait {
                return Err(MeshError::Timeout {
                    duration_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll_every).await;
        }
    }

    /// Deregisters every instance registered through this client.
    pub async fn cleanup(&self, ctx: &RequestContext) {
        let ids: Vec<String> = self.registered.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.deregister(ctx, &id).await {
                warn!(id = %id, error = %e, "failed to deregister during cleanup");
            }
        }
        for entry in self.pollers.iter() {
            entry.value().abort();
        }
        self.pollers.clear();
    }

    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }
}

impl Drop for ServiceRegistryClient {
    fn drop(&mut self) {
        for entry in self.pollers.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    fn setup() -> (Arc<InMemoryRegistry>, ServiceRegistryClient, RequestContext) {
        let store = Arc::new(InMemoryRegistry::new());
        let client = ServiceRegistryClient::new(store.clone());
        (store, client, RequestContext::new())
    }

    #[tokio::test]
    async fn test_register_rejects_missing_port() {
        let (store, client, ctx) = setup();
        let result = client
            .register(&ctx, ServiceDescriptor::new("orders", "1.0.0"))
            .await;
        assert!(matches!(result, Err(MeshError::Validation(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_register_defaults_id() {
        let (_, client, ctx) = setup();
        let result = client
            .register(&ctx, ServiceDescriptor::new("orders", "1.0.0").with_http_port(8002))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.id.starts_with("orders-"));
    }

    #[tokio::test]
    async fn test_discover_excludes_failing_instances() {
        let (store, client, ctx) = setup();
        for (id, port) in [("orders-1", 8001), ("orders-2", 8002)] {
            client
                .register(
                    &ctx,
                    ServiceDescriptor::new("orders", "1.0.0")
                        .with_id(id)
                        .with_http_port(port),
                )
                .await
                .unwrap();
        }
        store.set_instance_health("orders-2", HealthState::Critical);

        let all = client.discover(&ctx, "orders", false).await.unwrap();
        let passing = client.discover(&ctx, "orders", true).await.unwrap();

        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|i| i.id == "orders-2"));
        assert_eq!(passing.len(), 1);
        assert_eq!(passing[0].id, "orders-1");
    }

    #[tokio::test]
    async fn test_update_health_check_drives_ttl() {
        let (_, client, ctx) = setup();
        let desc = ServiceDescriptor::new("orders", "1.0.0")
            .with_id("orders-1")
            .with_http_port(8002)
            .with_health_check(HealthCheckSpec::Ttl { ttl: "30s".into() });
        client.register(&ctx, desc).await.unwrap();

        assert!(client.discover(&ctx, "orders", true).await.unwrap().is_empty());
        assert!(client
            .update_health_check(&ctx, "orders-1", true, "ok")
            .await
            .unwrap());
        assert_eq!(client.discover(&ctx, "orders", true).await.unwrap().len(), 1);

        let health = client.get_service_health(&ctx, "orders").await.unwrap();
        assert_eq!(health[0].health_status, HealthState::Passing);
        assert_eq!(health[0].checks[0].output, "ok");

        assert!(!client
            .update_health_check(&ctx, "missing-1", true, "ok")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_script_check_pushes_results() {
        let (_, client, ctx) = setup();
        let desc = ServiceDescriptor::new("worker", "1.0.0")
            .with_id("worker-1")
            .with_tcp_port(7000)
            .with_health_check(HealthCheckSpec::Script {
                command: "exit 0".into(),
                interval: "1s".into(),
                timeout: None,
            });
        client.register(&ctx, desc).await.unwrap();

        let instances = client
            .wait_for_service(
                &ctx,
                "worker",
                Duration::from_secs(5),
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        assert_eq!(instances[0].id, "worker-1");
    }

    #[tokio::test]
    async fn test_failing_script_reports_critical() {
        let (_, client, ctx) = setup();
        let desc = ServiceDescriptor::new("worker", "1.0.0")
            .with_id("worker-1")
            .with_tcp_port(7000)
            .with_health_check(HealthCheckSpec::Script {
                command: "echo down; exit 1".into(),
                interval: "1s".into(),
                timeout: None,
            });
        client.register(&ctx, desc).await.unwrap();

        let mut output = String::new();
        for _ in 0..100 {
            let health = client.get_service_health(&ctx, "worker").await.unwrap();
            output = health[0].checks[0].output.clone();
            if !output.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(output.contains("down"));
        assert!(client.discover(&ctx, "worker", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_and_info() {
        let (_, client, ctx) = setup();
        let desc = ServiceDescriptor::new("orders", "1.0.0")
            .with_id("orders-1")
            .with_http_port(8002)
            .with_dependency("payments");
        client.register(&ctx, desc).await.unwrap();

        let info = client.get_service_info(&ctx, "orders").await.unwrap().unwrap();
        assert_eq!(info.dependencies, vec!["payments"]);
        assert_eq!(client.list_services(&ctx).await.unwrap(), vec!["orders"]);

        assert!(client.deregister(&ctx, "orders-1").await.unwrap());
        assert!(client.discover(&ctx, "orders", false).await.unwrap().is_empty());
        assert!(client.get_service_info(&ctx, "orders").await.unwrap().is_none());
        assert!(!client.deregister(&ctx, "orders-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_info_prefers_smallest_instance_id() {
        let (_, client, ctx) = setup();
        for (id, port) in [("ledger-c", 9103), ("ledger-a", 9101), ("ledger-b", 9102)] {
            client
                .register(
                    &ctx,
                    ServiceDescriptor::new("ledger", "1.0.0")
                        .with_id(id)
                        .with_http_port(port),
                )
                .await
                .unwrap();
        }

        for _ in 0..5 {
            let info = client.get_service_info(&ctx, "ledger").await.unwrap().unwrap();
            assert_eq!(info.id.as_deref(), Some("ledger-a"));
            assert_eq!(info.http_port, Some(9101));
        }

        client.deregister(&ctx, "ledger-a").await.unwrap();
        let info = client.get_service_info(&ctx, "ledger").await.unwrap().unwrap();
        assert_eq!(info.id.as_deref(), Some("ledger-b"));
    }

    #[tokio::test]
    async fn test_initialize_fails_when_store_down() {
        let store = Arc::new(InMemoryRegistry::new());
        store.set_available(false);
        let client = ServiceRegistryClient::with_config(
            store,
            RegistryClientConfig {
                connect_retry: RetryConfig::new()
                    .with_max_retries(1)
                    .with_base_delay(Duration::from_millis(1)),
                ..Default::default()
            },
        );
        let result = client.initialize(&RequestContext::new()).await;
        assert!(matches!(result, Err(MeshError::Registry(_))));
    }

    #[tokio::test]
    async fn test_wait_for_service_times_out() {
        let (_, client, ctx) = setup();
        let result = client
            .wait_for_service(
                &ctx,
                "ghost",
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await;
        assert!(matches!(result, Err(MeshError::Timeout { .. })));
    }
}
