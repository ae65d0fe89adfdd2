//! Mesh manager: service lifecycle, health sweeps, aggregate metrics and events.
//!
//! Each known service lives in its own slot. A slot pairs the service state
//! (short synchronous critical sections) with an async tick lock held across
//! the registry queries of one health check, so two checks of the same
//! service never interleave while different services proceed independently.

use crate::config_center::{ConfigCenter, WatchId};
use crate::context::RequestContext;
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent, MeshEventType, SubscriptionId};
use crate::metrics::Metrics;
use crate::proxy_config::{ChangeListenerId, GenerateOptions, ProxyConfigGenerator};
use crate::registry::{ServiceDescriptor, ServiceInstance, ServiceRegistryClient};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle status of a service as tracked by the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshServiceStatus {
    /// Known from the registry at startup, not yet health-checked.
    Pending,
    Registered,
    Healthy,
    Degraded,
    Unhealthy,
    Deregistered,
}

impl MeshServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshServiceStatus::Pending => "PENDING",
            MeshServiceStatus::Registered => "REGISTERED",
            MeshServiceStatus::Healthy => "HEALTHY",
            MeshServiceStatus::Degraded => "DEGRADED",
            MeshServiceStatus::Unhealthy => "UNHEALTHY",
            MeshServiceStatus::Deregistered => "DEREGISTERED",
        }
    }

    /// Status implied by passing versus total instance counts.
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if healthy == 0 {
            MeshServiceStatus::Unhealthy
        } else if healthy >= total {
            MeshServiceStatus::Healthy
        } else {
            MeshServiceStatus::Degraded
        }
    }
}

impl fmt::Display for MeshServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered service plus mesh-local state.
#[derive(Debug, Clone, Serialize)]
pub struct MeshService {
    pub descriptor: ServiceDescriptor,
    pub instance_id: String,
    pub status: MeshServiceStatus,
    pub registration_time: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub deregistration_time: Option<DateTime<Utc>>,
    pub endpoints: Vec<ServiceInstance>,
}

impl MeshService {
    fn new(descriptor: ServiceDescriptor, instance_id: String, status: MeshServiceStatus) -> Self {
        Self {
            descriptor,
            instance_id,
            status,
            registration_time: Utc::now(),
            last_health_check: None,
            deregistration_time: None,
            endpoints: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

struct ServiceSlot {
    state: Mutex<MeshService>,
    tick: tokio::sync::Mutex<()>,
}

impl ServiceSlot {
    fn new(service: MeshService) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(service),
            tick: tokio::sync::Mutex::new(()),
        })
    }

    fn snapshot(&self) -> MeshService {
        self.state.lock().clone()
    }
}

/// Tunables for [`MeshManager`].
#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// Health sweep cadence. Zero disables the loop.
    pub health_check_interval: Duration,
    /// Metrics recompute cadence. Zero disables the loop.
    pub metrics_interval: Duration,
    /// Config-center keys re-emitted as `config_updated` events.
    pub watch_keys: Vec<String>,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            watch_keys: Vec::new(),
        }
    }
}

impl MeshOptions {
    pub fn with_health_check_interval(mut self, every: Duration) -> Self {
        self.health_check_interval = every;
        self
    }

    pub fn with_metrics_interval(mut self, every: Duration) -> Self {
        self.metrics_interval = every;
        self
    }

    pub fn with_watch_key(mut self, key: impl Into<String>) -> Self {
        self.watch_keys.push(key.into());
        self
    }
}

/// Mesh-wide aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshMetrics {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub total_endpoints: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Result of one service health check.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthReport {
    pub healthy: bool,
    pub status: MeshServiceStatus,
    pub healthy_count: usize,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshRegistration {
    pub success: bool,
    pub service_id: String,
    pub service: MeshService,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub registry: &'static str,
    pub config_center: &'static str,
    pub proxy_config: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub components: ComponentStatus,
    pub metrics: MeshMetrics,
}

fn running_label(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}

/// Top-level orchestrator tying the registry, config center and proxy
/// config generator together.
pub struct MeshManager {
    registry: Arc<ServiceRegistryClient>,
    config_center: Arc<dyn ConfigCenter>,
    generator: Arc<ProxyConfigGenerator>,
    options: MeshOptions,
    services: DashMap<String, Arc<ServiceSlot>>,
    metrics: RwLock<MeshMetrics>,
    events: Arc<EventBus>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watches: Mutex<Vec<WatchId>>,
    /// Generator listener re-emitting writes as `proxy_config_updated`.
    config_bridge: Mutex<Option<ChangeListenerId>>,
}

impl fmt::Debug for MeshManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshManager")
            .field("services", &self.services.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl MeshManager {
    pub fn new(
        registry: Arc<ServiceRegistryClient>,
        config_center: Arc<dyn ConfigCenter>,
        generator: Arc<ProxyConfigGenerator>,
        options: MeshOptions,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mesh = Self {
            registry,
            config_center,
            generator,
            options,
            services: DashMap::new(),
            metrics: RwLock::new(MeshMetrics::default()),
            events: Arc::new(EventBus::new()),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            watches: Mutex::new(Vec::new()),
            config_bridge: Mutex::new(None),
        };
        mesh.install_config_bridge();
        mesh
    }

    /// Forwards generator writes onto the event bus. No-op while installed;
    /// `ProxyConfigGenerator::stop` drops it, so `start` installs it again.
    fn install_config_bridge(&self) {
        let mut bridge = self.config_bridge.lock();
        if bridge.is_some() {
            return;
        }
        let events = Arc::clone(&self.events);
        let output_dir = self.generator.options().output_dir.clone();
        let id = self.generator.add_config_change_listener(move |service, _| {
            events.emit(MeshEvent::ProxyConfigUpdated {
                service_name: service.to_string(),
                path: output_dir.join(format!("{}.json", service)),
                timestamp: Utc::now(),
            });
        });
        *bridge = Some(id);
    }

    pub fn registry(&self) -> &Arc<ServiceRegistryClient> {
        &self.registry
    }

    pub fn generator(&self) -> &Arc<ProxyConfigGenerator> {
        &self.generator
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connects to the registry, loads existing services, runs a first health
    /// sweep and starts the periodic loops.
    #[instrument(level = "info", skip(self, ctx), fields(correlation_id = %ctx))]
    pub async fn start(self: &Arc<Self>, ctx: &RequestContext) -> Result<()> {
        self.registry.initialize(ctx).await?;
        self.install_config_bridge();
        self.watch_config_keys().await?;
        self.load_existing_services(ctx).await;

        if let Err(e) = self.check_service_health(ctx, None).await {
            warn!(error = %e, "initial health sweep failed");
        }
        if let Err(e) = self.generator.refresh_all_configs(ctx).await {
            warn!(error = %e, "initial proxy config refresh failed");
        }
        self.generator.start();

        self.spawn_loop(
            "health-check",
            self.options.health_check_interval,
            |mesh| async move {
                let ctx = RequestContext::background("health-check");
                if let Err(e) = mesh.check_service_health(&ctx, None).await {
                    error!(correlation_id = %ctx, error = %e, "periodic health check failed");
                }
            },
        );
        self.spawn_loop("metrics", self.options.metrics_interval, |mesh| async move {
            mesh.update_metrics();
        });

        self.running.store(true, Ordering::SeqCst);
        info!(services = self.services.len(), "service mesh started");
        self.events.emit(MeshEvent::mesh_status("running"));
        Ok(())
    }

    async fn watch_config_keys(&self) -> Result<()> {
        for key in &self.options.watch_keys {
            let events = Arc::clone(&self.events);
            let id = self
                .config_center
                .watch(
                    key,
                    Arc::new(move |key: &str, value: Option<&str>| {
                        info!(key, "config center value changed");
                        events.emit(MeshEvent::ConfigUpdated {
                            key: key.to_string(),
                            value: value.map(String::from),
                            timestamp: Utc::now(),
                        });
                    }),
                )
                .await?;
            self.watches.lock().push(id);
        }
        Ok(())
    }

    async fn load_existing_services(&self, ctx: &RequestContext) {
        let names = match self.registry.list_services(ctx).await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "failed to list existing services");
                return;
            }
        };
        for name in names {
            if self.services.contains_key(&name) {
                continue;
            }
            match self.registry.get_service_info(ctx, &name).await {
                Ok(Some(descriptor)) => {
                    let instance_id = descriptor.id.clone().unwrap_or_else(|| name.clone());
                    self.services.insert(
                        name,
                        ServiceSlot::new(MeshService::new(
                            descriptor,
                            instance_id,
                            MeshServiceStatus::Pending,
                        )),
                    );
                }
                Ok(None) => debug!(service = %name, "service has no agent registration"),
                Err(e) => error!(service = %name, error = %e, "failed to load service"),
            }
        }
        info!(count = self.services.len(), "loaded existing services");
    }

    /// Spawns a periodic task that stops on shutdown or once the manager is dropped.
    /// A tick runs to completion before the next one is considered.
    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, every: Duration, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if every.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(mesh) = weak.upgrade() else { break };
                        tick(mesh).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!(task = name, "mesh loop stopped");
        });
        self.tasks.lock().push(handle);
        info!(task = name, interval_ms = every.as_millis() as u64, "mesh loop started");
    }

    /// Registers a service with the registry and generates its proxy config.
    ///
    /// Re-registering a name replaces the previous entry. A proxy config
    /// failure is logged and does not fail the registration.
    #[instrument(level = "info", skip(self, ctx, descriptor), fields(correlation_id = %ctx, service = %descriptor.name))]
    pub async fn register_service(
        &self,
        ctx: &RequestContext,
        descriptor: ServiceDescriptor,
    ) -> Result<MeshRegistration> {
        descriptor.validate()?;
        if descriptor.version.trim().is_empty() {
            return Err(MeshError::Validation(format!(
                "service {} requires a version",
                descriptor.name
            )));
        }

        let registered = self.registry.register(ctx, descriptor.clone()).await?;
        let name = descriptor.name.clone();
        let service = MeshService::new(
            descriptor.with_id(registered.id.clone()),
            registered.id.clone(),
            MeshServiceStatus::Registered,
        );
        self.services
            .insert(name.clone(), ServiceSlot::new(service.clone()));

        self.regenerate_config(ctx, &name, &service.descriptor).await;

        self.update_metrics();
        info!(id = %registered.id, "service registered with mesh");
        self.events.emit(MeshEvent::ServiceRegistered {
            service: service.clone(),
        });

        Ok(MeshRegistration {
            success: true,
            service_id: registered.id,
            service,
        })
    }

    /// Writes the sidecar config for `name`. Failures are logged only.
    async fn regenerate_config(
        &self,
        ctx: &RequestContext,
        name: &str,
        descriptor: &ServiceDescriptor,
    ) {
        let options = GenerateOptions {
            http_port: descriptor.http_port,
            health_check_path: Some(descriptor.health_path().to_string()),
            lb_strategy: None,
        };
        if let Err(e) = self.generator.generate_config(ctx, name, &options).await {
            error!(service = name, error = %e, "failed to generate proxy config");
        }
    }

    /// Deregisters `name`. The entry is kept with status DEREGISTERED.
    /// Repeating the call returns `Ok(false)` and touches nothing.
    #[instrument(level = "info", skip(self, ctx), fields(correlation_id = %ctx))]
    pub async fn deregister_service(&self, ctx: &RequestContext, name: &str) -> Result<bool> {
        if name.trim().is_empty() {
            return Err(MeshError::Validation("service name is required".into()));
        }
        let slot = self
            .services
            .get(name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| MeshError::service_not_found(name))?;
        let _tick = slot.tick.lock().await;

        let (instance_id, status) = {
            let state = slot.state.lock();
            (state.instance_id.clone(), state.status)
        };
        if status == MeshServiceStatus::Deregistered {
            debug!(service = name, "service already deregistered");
            return Ok(false);
        }
        let removed = self.registry.deregister(ctx, &instance_id).await?;
        {
            let mut state = slot.state.lock();
            state.status = MeshServiceStatus::Deregistered;
            state.deregistration_time = Some(Utc::now());
            state.endpoints.clear();
        }

        if let Err(e) = self.generator.remove_config(name).await {
            warn!(error = %e, "failed to remove proxy config");
        }

        self.update_metrics();
        info!(id = %instance_id, removed, "service deregistered from mesh");
        self.events.emit(MeshEvent::ServiceDeregistered {
            name: name.to_string(),
            timestamp: Utc::now(),
        });
        Ok(removed)
    }

    /// Current view of `name` with freshly discovered endpoints.
    pub async fn get_service(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Option<MeshService>> {
        let Some(slot) = self.services.get(name).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };
        let mut service = slot.snapshot();
        if service.status != MeshServiceStatus::Deregistered {
            match self.registry.discover(ctx, name, false).await {
                Ok(endpoints) => service.endpoints = endpoints,
                Err(e) => warn!(service = name, error = %e, "discovery failed, using cached endpoints"),
            }
        }
        Ok(Some(service))
    }

    /// Every service the mesh knows, sorted by name, deregistered ones included.
    pub async fn list_services(&self, ctx: &RequestContext) -> Result<Vec<MeshService>> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(service) = self.get_service(ctx, &name).await? {
                out.push(service);
            }
        }
        Ok(out)
    }

    /// Checks one service, or every non-deregistered service when `name` is `None`.
    #[instrument(level = "debug", skip(self, ctx), fields(correlation_id = %ctx))]
    pub async fn check_service_health(
        &self,
        ctx: &RequestContext,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, ServiceHealthReport>> {
        let targets: Vec<(String, Arc<ServiceSlot>)> = match name {
            Some(name) => {
                let slot = self
                    .services
                    .get(name)
                    .map(|s| Arc::clone(s.value()))
                    .ok_or_else(|| MeshError::service_not_found(name))?;
                vec![(name.to_string(), slot)]
            }
            None => self
                .services
                .iter()
                .filter(|e| e.value().state.lock().status != MeshServiceStatus::Deregistered)
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect(),
        };

        let mut results = BTreeMap::new();
        for (name, slot) in targets {
            let report = self.check_single(ctx, &name, &slot).await;
            results.insert(name, report);
        }
        self.update_metrics();
        Ok(results)
    }

    async fn check_single(
        &self,
        ctx: &RequestContext,
        name: &str,
        slot: &ServiceSlot,
    ) -> ServiceHealthReport {
        let _tick = slot.tick.lock().await;
        if slot.state.lock().status == MeshServiceStatus::Deregistered {
            return ServiceHealthReport {
                healthy: false,
                status: MeshServiceStatus::Deregistered,
                healthy_count: 0,
                total_count: 0,
                error: None,
            };
        }

        let outcome = async {
            let passing = self.registry.discover(ctx, name, true).await?;
            let all = self.registry.discover(ctx, name, false).await?;
            Ok::<_, MeshError>((passing.len(), all))
        }
        .await;

        let (report, endpoints) = match outcome {
            Ok((healthy_count, all)) => {
                let total_count = all.len();
                let status = MeshServiceStatus::from_counts(healthy_count, total_count);
                (
                    ServiceHealthReport {
                        healthy: healthy_count > 0,
                        status,
                        healthy_count,
                        total_count,
                        error: None,
                    },
                    Some(all),
                )
            }
            Err(e) => {
                error!(service = name, error = %e, "health check failed");
                (
                    ServiceHealthReport {
                        healthy: false,
                        status: MeshServiceStatus::Unhealthy,
                        healthy_count: 0,
                        total_count: 0,
                        error: Some(e.to_string()),
                    },
                    None,
                )
            }
        };

        let (previous, descriptor) = {
            let mut state = slot.state.lock();
            let previous = state.status;
            state.status = report.status;
            state.last_health_check = Some(Utc::now());
            if let Some(endpoints) = endpoints {
                state.endpoints = endpoints;
            }
            (previous, state.descriptor.clone())
        };

        if previous != report.status {
            info!(
                service = name,
                old = %previous,
                new = %report.status,
                "service health changed"
            );
            self.events.emit(MeshEvent::ServiceHealthChanged {
                service_name: name.to_string(),
                old_status: previous,
                new_status: report.status,
                healthy_count: report.healthy_count,
                total_count: report.total_count,
                timestamp: Utc::now(),
            });
            self.regenerate_config(ctx, name, &descriptor).await;
        }
        report
    }

    /// Recomputes the mesh-wide aggregates from the current service states.
    pub fn update_metrics(&self) -> MeshMetrics {
        let mut metrics = MeshMetrics::default();
        for entry in self.services.iter() {
            let state = entry.value().state.lock();
            if state.status == MeshServiceStatus::Deregistered {
                continue;
            }
            metrics.total_services += 1;
            match state.status {
                MeshServiceStatus::Healthy | MeshServiceStatus::Degraded => {
                    metrics.healthy_services += 1
                }
                MeshServiceStatus::Unhealthy => metrics.unhealthy_services += 1,
                _ => {}
            }
            metrics.total_endpoints += state.endpoints.len();
        }
        metrics.last_updated = Some(Utc::now());

        Metrics::set_mesh_totals(
            metrics.total_services,
            metrics.healthy_services,
            metrics.unhealthy_services,
            metrics.total_endpoints,
        );
        *self.metrics.write() = metrics.clone();
        metrics
    }

    pub fn get_mesh_metrics(&self) -> MeshMetrics {
        self.metrics.read().clone()
    }

    pub fn get_mesh_status(&self) -> MeshStatus {
        let running = self.is_running();
        MeshStatus {
            status: running_label(running),
            timestamp: Utc::now(),
            components: ComponentStatus {
                registry: running_label(running),
                config_center: running_label(running),
                proxy_config: running_label(self.generator.is_running()),
            },
            metrics: self.get_mesh_metrics(),
        }
    }

    pub fn on<F>(&self, event_type: MeshEventType, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.events.on(event_type, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    /// Stops both loops (letting an in-flight tick finish), drops config
    /// watches and stops the proxy config generator. Event subscriptions
    /// survive, so a later `start` reports to the same handlers.
    pub async fn shutdown(&self) {
        info!("stopping service mesh");
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "mesh loop join error");
            }
        }

        let watches: Vec<WatchId> = self.watches.lock().drain(..).collect();
        for id in watches {
            self.config_center.unwatch(id).await;
        }

        self.generator.stop();
        self.config_bridge.lock().take();
        self.running.store(false, Ordering::SeqCst);
        self.events.emit(MeshEvent::mesh_status("stopped"));
        info!("service mesh stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_center::InMemoryConfigCenter;
    use crate::proxy_config::ProxyConfigOptions;
    use crate::registry::{HealthState, InMemoryRegistry};

    struct Harness {
        _dir: tempfile::TempDir,
        backend: Arc<InMemoryRegistry>,
        config_center: Arc<InMemoryConfigCenter>,
        mesh: Arc<MeshManager>,
    }

    fn harness(options: MeshOptions) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryRegistry::new());
        let registry = Arc::new(ServiceRegistryClient::new(backend.clone()));
        let generator = Arc::new(ProxyConfigGenerator::new(
            Arc::clone(&registry),
            ProxyConfigOptions::default()
                .with_output_dir(dir.path())
                .with_refresh_interval(Duration::ZERO),
        ));
        let config_center = Arc::new(InMemoryConfigCenter::new());
        let mesh = Arc::new(MeshManager::new(
            registry,
            config_center.clone(),
            generator,
            options,
        ));
        Harness {
            _dir: dir,
            backend,
            config_center,
            mesh,
        }
    }

    fn quiet() -> MeshOptions {
        MeshOptions::default()
            .with_health_check_interval(Duration::ZERO)
            .with_metrics_interval(Duration::ZERO)
    }

    fn recorder(mesh: &MeshManager, event_type: MeshEventType) -> Arc<Mutex<Vec<MeshEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        mesh.on(event_type, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(MeshServiceStatus::from_counts(3, 3), MeshServiceStatus::Healthy);
        assert_eq!(MeshServiceStatus::from_counts(2, 3), MeshServiceStatus::Degraded);
        assert_eq!(MeshServiceStatus::from_counts(0, 3), MeshServiceStatus::Unhealthy);
        assert_eq!(MeshServiceStatus::from_counts(0, 0), MeshServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_register_requires_version_and_port() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        let err = h
            .mesh
            .register_service(&ctx, ServiceDescriptor::new("a", "").with_http_port(80))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));

        let err = h
            .mesh
            .register_service(&ctx, ServiceDescriptor::new("a", "1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
        assert!(h.backend.is_empty());
    }

    #[tokio::test]
    async fn test_register_emits_events_and_updates_metrics() {
        let h = harness(quiet());
        let registered = recorder(&h.mesh, MeshEventType::ServiceRegistered);
        let proxy = recorder(&h.mesh, MeshEventType::ProxyConfigUpdated);
        let ctx = RequestContext::new();

        let result = h
            .mesh
            .register_service(
                &ctx,
                ServiceDescriptor::new("orders", "1.0.0")
                    .with_id("orders-1")
                    .with_http_port(8002),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.service_id, "orders-1");
        assert_eq!(result.service.status, MeshServiceStatus::Registered);

        assert_eq!(registered.lock().len(), 1);
        assert_eq!(proxy.lock().len(), 1);
        assert_eq!(h.mesh.get_mesh_metrics().total_services, 1);
    }

    #[tokio::test]
    async fn test_health_transitions_emit_only_on_change() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        h.mesh
            .register_service(
                &ctx,
                ServiceDescriptor::new("catalog", "1")
                    .with_id("catalog-1")
                    .with_http_port(9001),
            )
            .await
            .unwrap();
        for (id, port) in [("catalog-2", 9002), ("catalog-3", 9003)] {
            h.mesh
                .registry()
                .register(
                    &ctx,
                    ServiceDescriptor::new("catalog", "1")
                        .with_id(id)
                        .with_http_port(port),
                )
                .await
                .unwrap();
        }
        let changes = recorder(&h.mesh, MeshEventType::ServiceHealthChanged);

        let check = |expected: MeshServiceStatus| {
            let mesh = Arc::clone(&h.mesh);
            async move {
                let report = mesh
                    .check_service_health(&RequestContext::new(), Some("catalog"))
                    .await
                    .unwrap();
                assert_eq!(report["catalog"].status, expected);
            }
        };

        check(MeshServiceStatus::Healthy).await;
        check(MeshServiceStatus::Healthy).await;
        assert_eq!(changes.lock().len(), 1);

        h.backend.set_instance_health("catalog-3", HealthState::Critical);
        check(MeshServiceStatus::Degraded).await;

        h.backend.set_instance_health("catalog-1", HealthState::Critical);
        h.backend.set_instance_health("catalog-2", HealthState::Critical);
        check(MeshServiceStatus::Unhealthy).await;
        check(MeshServiceStatus::Unhealthy).await;

        let seen: Vec<(MeshServiceStatus, MeshServiceStatus)> = changes
            .lock()
            .iter()
            .filter_map(|e| match e {
                MeshEvent::ServiceHealthChanged {
                    old_status,
                    new_status,
                    ..
                } => Some((*old_status, *new_status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                (MeshServiceStatus::Registered, MeshServiceStatus::Healthy),
                (MeshServiceStatus::Healthy, MeshServiceStatus::Degraded),
                (MeshServiceStatus::Degraded, MeshServiceStatus::Unhealthy),
            ]
        );

        let metrics = h.mesh.get_mesh_metrics();
        assert_eq!(metrics.unhealthy_services, 1);
        assert_eq!(metrics.total_endpoints, 3);
    }

    #[tokio::test]
    async fn test_registry_failure_marks_unhealthy() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        h.mesh
            .register_service(&ctx, ServiceDescriptor::new("s", "1").with_http_port(1))
            .await
            .unwrap();
        h.backend.set_available(false);

        let report = h.mesh.check_service_health(&ctx, None).await.unwrap();
        assert_eq!(report["s"].status, MeshServiceStatus::Unhealthy);
        assert!(report["s"].error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        assert!(h.mesh.get_service(&ctx, "nope").await.unwrap().is_none());
        assert!(matches!(
            h.mesh.check_service_health(&ctx, Some("nope")).await,
            Err(MeshError::NotFound { .. })
        ));
        assert!(matches!(
            h.mesh.deregister_service(&ctx, "nope").await,
            Err(MeshError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_loads_existing_and_shutdown_stops_loops() {
        let h = harness(
            MeshOptions::default()
                .with_health_check_interval(Duration::from_millis(20))
                .with_metrics_interval(Duration::from_millis(20))
                .with_watch_key("mesh.routing"),
        );
        let ctx = RequestContext::new();
        h.mesh
            .registry()
            .register(
                &ctx,
                ServiceDescriptor::new("legacy", "0.9")
                    .with_id("legacy-1")
                    .with_http_port(7000),
            )
            .await
            .unwrap();

        let status_events = recorder(&h.mesh, MeshEventType::MeshStatusChanged);
        let config_events = recorder(&h.mesh, MeshEventType::ConfigUpdated);

        h.mesh.start(&ctx).await.unwrap();
        assert!(h.mesh.is_running());
        assert_eq!(h.mesh.get_mesh_status().status, "running");

        let legacy = h.mesh.get_service(&ctx, "legacy").await.unwrap().unwrap();
        assert_eq!(legacy.status, MeshServiceStatus::Healthy);
        assert_eq!(legacy.instance_id, "legacy-1");

        h.config_center.set("mesh.routing", "v2");
        assert_eq!(config_events.lock().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.mesh.shutdown().await;
        assert!(!h.mesh.is_running());
        assert!(h.mesh.tasks.lock().is_empty());
        assert_eq!(status_events.lock().len(), 2);
        assert_eq!(h.mesh.events().handler_count(), 2);
    }

    #[tokio::test]
    async fn test_health_transition_regenerates_proxy_config() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        h.mesh
            .register_service(
                &ctx,
                ServiceDescriptor::new("pay", "1.0.0")
                    .with_id("pay-1")
                    .with_http_port(8400),
            )
            .await
            .unwrap();
        h.mesh.check_service_health(&ctx, Some("pay")).await.unwrap();

        let proxy = recorder(&h.mesh, MeshEventType::ProxyConfigUpdated);
        let changes = recorder(&h.mesh, MeshEventType::ServiceHealthChanged);

        h.mesh.check_service_health(&ctx, Some("pay")).await.unwrap();
        assert!(proxy.lock().is_empty());

        h.backend.set_instance_health("pay-1", HealthState::Critical);
        let report = h.mesh.check_service_health(&ctx, Some("pay")).await.unwrap();
        assert_eq!(report["pay"].status, MeshServiceStatus::Unhealthy);
        assert_eq!(changes.lock().len(), 1);
        assert_eq!(proxy.lock().len(), 1);
        match &proxy.lock()[0] {
            MeshEvent::ProxyConfigUpdated { service_name, .. } => assert_eq!(service_name, "pay"),
            other => panic!("unexpected event {:?}", other),
        };
    }

    #[tokio::test]
    async fn test_restart_keeps_proxy_config_events() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        let proxy = recorder(&h.mesh, MeshEventType::ProxyConfigUpdated);

        h.mesh.start(&ctx).await.unwrap();
        h.mesh.shutdown().await;
        h.mesh.start(&ctx).await.unwrap();
        assert!(h.mesh.is_running());

        h.mesh
            .register_service(
                &ctx,
                ServiceDescriptor::new("ledger", "2.0.0")
                    .with_id("ledger-1")
                    .with_http_port(8500),
            )
            .await
            .unwrap();
        assert_eq!(proxy.lock().len(), 1);
        assert_eq!(h.mesh.events().handler_count(), 1);
        h.mesh.shutdown().await;
    }

    #[tokio::test]
    async fn test_deregister_twice_is_a_no_op() {
        let h = harness(quiet());
        let ctx = RequestContext::new();
        h.mesh
            .register_service(
                &ctx,
                ServiceDescriptor::new("audit", "1.0.0")
                    .with_id("audit-1")
                    .with_http_port(8600),
            )
            .await
            .unwrap();
        let gone = recorder(&h.mesh, MeshEventType::ServiceDeregistered);

        assert!(h.mesh.deregister_service(&ctx, "audit").await.unwrap());
        assert!(!h.mesh.deregister_service(&ctx, "audit").await.unwrap());
        assert_eq!(gone.lock().len(), 1);

        let service = h.mesh.get_service(&ctx, "audit").await.unwrap().unwrap();
        assert_eq!(service.status, MeshServiceStatus::Deregistered);
    }
}
