//! Renders registry state into per-service sidecar configuration files.

use super::envoy::{
    duration_string, Address, Admin, Bootstrap, Cluster, ClusterSpec, DynamicResources, Listener,
    ListenerSpec, PathConfigSource, ResourceList, StaticResources, CLUSTER_TYPE, LISTENER_TYPE,
};
use crate::context::RequestContext;
use crate::error::{MeshError, Result};
use crate::load_balancer::LoadBalancerStrategy;
use crate::registry::ServiceRegistryClient;
use crate::retry::RetryConfig;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Generator-wide settings.
#[derive(Debug, Clone)]
pub struct ProxyConfigOptions {
    pub output_dir: PathBuf,
    /// Cadence of the background refresh. Zero disables it.
    pub refresh_interval: Duration,
    pub admin_access_log_path: String,
    pub admin_address: String,
    pub admin_port: u16,
    pub stats_flush_interval: Duration,
    pub listen_address: String,
    pub route_timeout: Duration,
    pub access_log_path: String,
    pub retry: RetryConfig,
}

impl Default for ProxyConfigOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp/envoy-configs"),
            refresh_interval: Duration::from_secs(30),
            admin_access_log_path: "/dev/null".to_string(),
            admin_address: "127.0.0.1".to_string(),
            admin_port: 9901,
            stats_flush_interval: Duration::from_secs(10),
            listen_address: "0.0.0.0".to_string(),
            route_timeout: Duration::from_secs(15),
            access_log_path: "/dev/stdout".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl ProxyConfigOptions {
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_refresh_interval(mut self, every: Duration) -> Self {
        self.refresh_interval = every;
        self
    }
}

/// Per-call overrides for [`ProxyConfigGenerator::generate_config`].
///
/// Unset fields fall back to the service's registered descriptor.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub http_port: Option<u16>,
    pub health_check_path: Option<String>,
    pub lb_strategy: Option<LoadBalancerStrategy>,
}

impl GenerateOptions {
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = Some(path.into());
        self
    }

    pub fn with_lb_strategy(mut self, strategy: LoadBalancerStrategy) -> Self {
        self.lb_strategy = Some(strategy);
        self
    }
}

/// Outcome of [`ProxyConfigGenerator::refresh_all_configs`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub generated: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeListenerId(u64);

type ChangeListener = Arc<dyn Fn(&str, &Bootstrap) + Send + Sync>;

/// Writes `<service>.json`, `<service>-listeners.json` and `<service>-clusters.json`.
pub struct ProxyConfigGenerator {
    registry: Arc<ServiceRegistryClient>,
    options: ProxyConfigOptions,
    cache: DashMap<String, Bootstrap>,
    listeners: RwLock<Vec<(ChangeListenerId, ChangeListener)>>,
    next_listener: AtomicU64,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProxyConfigGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfigGenerator")
            .field("output_dir", &self.options.output_dir)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ProxyConfigGenerator {
    pub fn new(registry: Arc<ServiceRegistryClient>, options: ProxyConfigOptions) -> Self {
        Self {
            registry,
            options,
            cache: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ProxyConfigOptions {
        &self.options
    }

    pub fn main_path(&self, service: &str) -> PathBuf {
        self.options.output_dir.join(format!("{}.json", service))
    }

    pub fn listeners_path(&self, service: &str) -> PathBuf {
        self.options
            .output_dir
            .join(format!("{}-listeners.json", service))
    }

    pub fn clusters_path(&self, service: &str) -> PathBuf {
        self.options
            .output_dir
            .join(format!("{}-clusters.json", service))
    }

    /// Builds and writes the configuration of `service`. Returns the main document's path.
    #[instrument(level = "info", skip(self, ctx, options), fields(correlation_id = %ctx))]
    pub async fn generate_config(
        &self,
        ctx: &RequestContext,
        service: &str,
        options: &GenerateOptions,
    ) -> Result<PathBuf> {
        if service.trim().is_empty() {
            return Err(MeshError::Validation("service name is required".into()));
        }
        let info = self
            .registry
            .get_service_info(ctx, service)
            .await?
            .ok_or_else(|| MeshError::service_not_found(service))?;

        let strategy = options.lb_strategy.unwrap_or_default();
        let health_path = options
            .health_check_path
            .clone()
            .unwrap_or_else(|| info.health_path().to_string());

        let mut listeners: Vec<Listener> = Vec::new();
        if let Some(port) = info.http_port.or(options.http_port) {
            listeners.push(
                ListenerSpec {
                    service,
                    listen_address: &self.options.listen_address,
                    port,
                    route_timeout: self.options.route_timeout,
                    retry: &self.options.retry,
                    access_log_path: &self.options.access_log_path,
                }
                .build(),
            );
        }

        let mut clusters: Vec<Cluster> = vec![ClusterSpec {
            service,
            strategy,
            health_check_path: &health_path,
            endpoints: self.endpoints(ctx, service).await?,
            http2: true,
        }
        .build()];

        for dependency in &info.dependencies {
            clusters.push(self.dependency_cluster(ctx, dependency, strategy).await);
        }

        let bootstrap = Bootstrap {
            static_resources: StaticResources {
                listeners: listeners.clone(),
                clusters: clusters.clone(),
            },
            admin: Admin {
                access_log_path: self.options.admin_access_log_path.clone(),
                address: Address::new(&self.options.admin_address, self.options.admin_port),
            },
            dynamic_resources: DynamicResources {
                cds_config: PathConfigSource {
                    path: self.clusters_path(service).display().to_string(),
                },
                lds_config: PathConfigSource {
                    path: self.listeners_path(service).display().to_string(),
                },
            },
            stats_flush_interval: duration_string(self.options.stats_flush_interval),
        };

        tokio::fs::create_dir_all(&self.options.output_dir).await?;
        write_json(
            &self.listeners_path(service),
            &ResourceList::new(LISTENER_TYPE, &listeners),
        )
        .await?;
        write_json(
            &self.clusters_path(service),
            &ResourceList::new(CLUSTER_TYPE, &clusters),
        )
        .await?;
        let path = self.main_path(service);
        write_json(&path, &bootstrap).await?;

        info!(path = %path.display(), clusters = clusters.len(), "proxy config generated");
        self.cache.insert(service.to_string(), bootstrap.clone());
        self.notify(service, &bootstrap);
        Ok(path)
    }

    async fn endpoints(&self, ctx: &RequestContext, service: &str) -> Result<Vec<(String, u16)>> {
        Ok(self
            .registry
            .discover(ctx, service, false)
            .await?
            .into_iter()
            .map(|i| (i.address, i.port))
            .collect())
    }

    /// Dependency clusters are always emitted so the sidecar can start before
    /// its dependencies register; lookup failures fall back to the placeholder.
    async fn dependency_cluster(
        &self,
        ctx: &RequestContext,
        dependency: &str,
        strategy: LoadBalancerStrategy,
    ) -> Cluster {
        let health_path = match self.registry.get_service_info(ctx, dependency).await {
            Ok(Some(info)) => info.health_path().to_string(),
            Ok(None) => {
                warn!(dependency, "dependency not registered yet, using placeholder endpoint");
                "/health".to_string()
            }
            Err(e) => {
                warn!(dependency, error = %e, "failed to look up dependency");
                "/health".to_string()
            }
        };
        let endpoints = self.endpoints(ctx, dependency).await.unwrap_or_else(|e| {
            warn!(dependency, error = %e, "failed to discover dependency instances");
            Vec::new()
        });
        ClusterSpec {
            service: dependency,
            strategy,
            health_check_path: &health_path,
            endpoints,
            http2: false,
        }
        .build()
    }

    /// Regenerates every registry service in parallel. One service failing
    /// does not stop the others.
    pub async fn refresh_all_configs(&self, ctx: &RequestContext) -> Result<RefreshReport> {
        let services = self.registry.list_services(ctx).await?;
        let defaults = GenerateOptions::default();
        let results = join_all(
            services
                .iter()
                .map(|name| self.generate_config(ctx, name, &defaults)),
        )
        .await;

        let mut report = RefreshReport::default();
        for (name, result) in services.into_iter().zip(results) {
            match result {
                Ok(_) => report.generated.push(name),
                Err(e) => {
                    error!(service = %name, error = %e, "failed to refresh proxy config");
                    report.failed.push(name);
                }
            }
        }
        debug!(
            generated = report.generated.len(),
            failed = report.failed.len(),
            "proxy config refresh complete"
        );
        Ok(report)
    }

    /// Last configuration generated for `service`.
    pub fn get_config(&self, service: &str) -> Option<Bootstrap> {
        self.cache.get(service).map(|c| c.value().clone())
    }

    pub fn cluster_names(&self, service: &str) -> Vec<String> {
        self.get_config(service)
            .map(|b| {
                b.static_resources
                    .clusters
                    .iter()
                    .map(|c| c.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deletes the generated files of `service`. Returns whether anything existed.
    pub async fn remove_config(&self, service: &str) -> Result<bool> {
        let mut removed = self.cache.remove(service).is_some();
        for path in [
            self.main_path(service),
            self.listeners_path(service),
            self.clusters_path(service),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            info!(service, "proxy config removed");
        }
        Ok(removed)
    }

    pub fn add_config_change_listener<F>(&self, listener: F) -> ChangeListenerId
    where
        F: Fn(&str, &Bootstrap) + Send + Sync + 'static,
    {
        let id = ChangeListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_config_change_listener(&self, id: ChangeListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify(&self, service: &str, bootstrap: &Bootstrap) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(service, bootstrap))).is_err() {
                error!(service, "config change listener panicked");
            }
        }
    }

    /// Starts the background refresh loop. A second call replaces the first loop.
    pub fn start(self: &Arc<Self>) {
        let every = self.options.refresh_interval;
        if every.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(generator) = weak.upgrade() else {
                    break;
                };
                let ctx = RequestContext::background("proxy-config-refresh");
                if let Err(e) = generator.refresh_all_configs(&ctx).await {
                    warn!(correlation_id = %ctx, error = %e, "proxy config refresh failed");
                }
            }
        });
        if let Some(previous) = self.refresh_task.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = every.as_millis() as u64, "proxy config refresh started");
    }

    /// Cancels the refresh loop and drops every change listener.
    pub fn stop(&self) {
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        self.listeners.write().clear();
        info!("proxy config generator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.refresh_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ProxyConfigGenerator {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Writes pretty JSON through a uniquely named temp file and a rename, so
/// readers never observe a partial document.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MeshError::InvalidConfig(format!("bad output path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
