//! API gateway: route matching, middleware, rate limiting and forwarding.
//!
//! A request flows through: management endpoints, route match, the route's
//! rate limiter, body buffering, middleware chain, then forwarding. Limiters
//! keyed by identity run after the middleware chain instead, since the
//! identity is set by an authentication middleware.
//! Service routes resolve a passing instance through the registry on every
//! request, pick one with the route's load-balancing strategy and call it
//! through that service's circuit breaker with a timeout. Static routes go
//! straight to their fixed URL. Every failure is rendered as the same JSON
//! error envelope carrying the request's correlation id.

mod admin;
mod forward;
mod listener;
pub mod middleware;

pub use listener::{GatewayListener, GatewayProtocol};
pub use middleware::{
    ApiKeyAuth, BearerAuth, GatewayRequest, JsonBody, JwtAuth, Middleware, MiddlewareRegistry,
    RequireHeaders, RequireJsonFields,
};

use crate::circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::config::MeshConfig;
use crate::context::{RequestContext, CORRELATION_HEADER};
use crate::error::{MeshError, Result, UnavailableReason};
use crate::load_balancer::{LoadBalancer, LoadBalancerStrategy};
use crate::mesh::{MeshManager, MeshMetrics};
use crate::metrics::Metrics;
use crate::ratelimit::{IdentifierKind, RateLimiter, RequestInfo};
use crate::router::{
    CircuitBreakerSpec, MethodMatch, PathMatch, RateLimitSpec, Route, RouteTarget, Router,
    RoutingConfig,
};
use crate::registry::ServiceRegistryClient;
use dashmap::DashMap;
use forward::UpstreamClient;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tower::Service;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Response body type produced by the gateway.
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Gateway-wide settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Forwarding budget when a route sets none.
    pub request_timeout: Duration,
    /// Largest request body buffered before forwarding.
    pub max_body_bytes: usize,
    /// Strategy for service routes registered without one.
    pub default_strategy: LoadBalancerStrategy,
    /// Cadence of the rate-limiter sweep.
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 1024 * 1024,
            default_strategy: LoadBalancerStrategy::RoundRobin,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&MeshConfig> for GatewayConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            max_body_bytes: config.max_body_bytes,
            default_strategy: config.lb_strategy,
            ..Self::default()
        }
    }
}

/// Options for [`GatewayRouter::register_service_route`].
#[derive(Debug, Clone, Default)]
pub struct ServiceRouteOptions {
    /// Route name; defaults to `<service>:<path>`.
    pub name: Option<String>,
    pub method: MethodMatch,
    pub middlewares: Vec<String>,
    pub rate_limit: Option<RateLimitSpec>,
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    pub load_balancer: Option<LoadBalancerStrategy>,
    pub hash_header: Option<String>,
    pub timeout: Option<Duration>,
    pub rewrite: Option<String>,
}

impl ServiceRouteOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_method(mut self, method: MethodMatch) -> Self {
        self.method = method;
        self
    }

    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middlewares.push(name.into());
        self
    }

    pub fn with_rate_limit(mut self, spec: RateLimitSpec) -> Self {
        self.rate_limit = Some(spec);
        self
    }

    pub fn with_circuit_breaker(mut self, spec: CircuitBreakerSpec) -> Self {
        self.circuit_breaker = Some(spec);
        self
    }

    pub fn with_load_balancer(mut self, strategy: LoadBalancerStrategy) -> Self {
        self.load_balancer = Some(strategy);
        self
    }

    pub fn with_hash_header(mut self, header: impl Into<String>) -> Self {
        self.hash_header = Some(header.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rewrite(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite = Some(rewrite.into());
        self
    }
}

/// Options for [`GatewayRouter::register_static_route`].
#[derive(Debug, Clone, Default)]
pub struct StaticRouteOptions {
    /// Route name; defaults to `static:<path>`.
    pub name: Option<String>,
    pub method: MethodMatch,
    pub middlewares: Vec<String>,
    pub rate_limit: Option<RateLimitSpec>,
    pub timeout: Option<Duration>,
    pub rewrite: Option<String>,
}

impl StaticRouteOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_method(mut self, method: MethodMatch) -> Self {
        self.method = method;
        self
    }

    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middlewares.push(name.into());
        self
    }

    pub fn with_rate_limit(mut self, spec: RateLimitSpec) -> Self {
        self.rate_limit = Some(spec);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rewrite(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite = Some(rewrite.into());
        self
    }
}

fn apply_common(
    mut route: Route,
    method: MethodMatch,
    middlewares: Vec<String>,
    rate_limit: Option<RateLimitSpec>,
    timeout: Option<Duration>,
    rewrite: Option<String>,
) -> Route {
    route.method = method;
    route.middlewares = middlewares;
    route.rate_limit = rate_limit;
    route.timeout_ms = timeout.map(|t| t.as_millis() as u64);
    route.rewrite = rewrite;
    route
}

#[derive(Debug, Default)]
struct GatewayStats {
    requests: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    rate_limited: AtomicU64,
}

/// Summary of one route for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub name: String,
    pub method: MethodMatch,
    pub path: PathMatch,
    pub target: RouteTarget,
    pub load_balancer: LoadBalancerStrategy,
    pub rate_limited: bool,
}

/// Read-only snapshot served at `/admin/gateway/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatsSnapshot {
    pub requests: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub rate_limited: u64,
    pub uptime_secs: u64,
    pub routes: Vec<RouteSummary>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    /// Tracked identifiers per rate-limited route.
    pub rate_limiters: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshMetrics>,
}

/// Route label and upstream recorded while a request is handled.
#[derive(Debug, Default)]
struct Exchange {
    route: Option<String>,
    upstream: Option<String>,
    headers: HeaderMap,
}

struct GatewayInner {
    config: GatewayConfig,
    registry: Arc<ServiceRegistryClient>,
    router: RwLock<Router>,
    middlewares: MiddlewareRegistry,
    limiters: DashMap<String, Arc<RateLimiter>>,
    breakers: CircuitBreakerRegistry,
    balancer: LoadBalancer,
    client: UpstreamClient,
    mesh: RwLock<Option<Arc<MeshManager>>>,
    stats: GatewayStats,
    started: Instant,
}

/// Registry-aware API gateway. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct GatewayRouter {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for GatewayRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRouter")
            .field("routes", &self.inner.router.read().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl GatewayRouter {
    pub fn new(registry: Arc<ServiceRegistryClient>, config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                registry,
                router: RwLock::new(Router::new()),
                middlewares: MiddlewareRegistry::new(),
                limiters: DashMap::new(),
                breakers: CircuitBreakerRegistry::new(),
                balancer: LoadBalancer::new(),
                client: forward::new_client(),
                mesh: RwLock::new(None),
                stats: GatewayStats::default(),
                started: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistryClient> {
        &self.inner.registry
    }

    /// Attaches a mesh manager so the management endpoints can report on it.
    pub fn attach_mesh(&self, mesh: Arc<MeshManager>) {
        *self.inner.mesh.write() = Some(mesh);
    }

    fn mesh(&self) -> Option<Arc<MeshManager>> {
        self.inner.mesh.read().clone()
    }

    pub fn register_middleware<M>(&self, name: impl Into<String>, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.inner.middlewares.register(name, Arc::new(middleware));
    }

    /// Adds a registered middleware to the chain every route runs first.
    pub fn use_global_middleware(&self, name: &str) -> Result<()> {
        self.inner.middlewares.use_global(name)
    }

    /// Validates and installs `route`, replacing any route with the same name.
    pub fn register_route(&self, route: Route) -> Result<()> {
        route.validate()?;
        self.inner.middlewares.ensure_known(&route.middlewares)?;

        match &route.rate_limit {
            Some(spec) => {
                self.inner
                    .limiters
                    .insert(route.name.clone(), Arc::new(RateLimiter::new(spec.to_config())));
            }
            None => {
                self.inner.limiters.remove(&route.name);
            }
        }

        if let RouteTarget::Service { service } = &route.target {
            let spec = route.circuit_breaker.clone().unwrap_or_default();
            self.inner.breakers.get_or_create(service, &spec.to_config());
        }

        info!(
            route = %route.name,
            method = ?route.method,
            target = %route.target.label(),
            "route registered"
        );
        self.inner.router.write().add_route(route);
        Ok(())
    }

    /// Mounts `service` at `path`. `path` follows [`PathMatch::from_pattern`].
    pub fn register_service_route(
        &self,
        path: &str,
        service: &str,
        options: ServiceRouteOptions,
    ) -> Result<()> {
        let name = options
            .name
            .unwrap_or_else(|| format!("{}:{}", service, path));
        let mut route = apply_common(
            Route::new(name, PathMatch::from_pattern(path), RouteTarget::service(service)),
            options.method,
            options.middlewares,
            options.rate_limit,
            options.timeout,
            options.rewrite,
        );
        route.circuit_breaker = options.circuit_breaker;
        route.load_balancer = options
            .load_balancer
            .unwrap_or(self.inner.config.default_strategy);
        route.hash_header = options.hash_header;
        self.register_route(route)
    }

    /// Mounts a fixed upstream URL at `path`.
    pub fn register_static_route(
        &self,
        path: &str,
        target: &str,
        options: StaticRouteOptions,
    ) -> Result<()> {
        let name = options.name.unwrap_or_else(|| format!("static:{}", path));
        let route = apply_common(
            Route::new(name, PathMatch::from_pattern(path), RouteTarget::fixed(target)),
            options.method,
            options.middlewares,
            options.rate_limit,
            options.timeout,
            options.rewrite,
        );
        self.register_route(route)
    }

    /// Installs every route of a routing file. Fails on the first invalid one.
    pub fn load_routes(&self, config: RoutingConfig) -> Result<usize> {
        for name in &config.global_middlewares {
            self.use_global_middleware(name)?;
        }
        let count = config.routes.len();
        for route in config.routes {
            self.register_route(route)?;
        }
        Ok(count)
    }

    pub fn remove_route(&self, name: &str) -> bool {
        self.inner.limiters.remove(name);
        self.inner.router.write().remove_route(name).is_some()
    }

    pub fn route_count(&self) -> usize {
        self.inner.router.read().len()
    }

    pub fn circuit_breaker_states(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.inner
            .breakers
            .snapshots()
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect()
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        let stats = &self.inner.stats;
        let routes = self
            .inner
            .router
            .read()
            .routes()
            .iter()
            .map(|r| RouteSummary {
                name: r.name.clone(),
                method: r.method.clone(),
                path: r.path.clone(),
                target: r.target.clone(),
                load_balancer: r.load_balancer,
                rate_limited: r.rate_limit.is_some(),
            })
            .collect();
        let rate_limiters = self
            .inner
            .limiters
            .iter()
            .map(|e| (e.key().clone(), e.value().tracked()))
            .collect();

        GatewayStatsSnapshot {
            requests: stats.requests.load(Ordering::Relaxed),
            client_errors: stats.client_errors.load(Ordering::Relaxed),
            server_errors: stats.server_errors.load(Ordering::Relaxed),
            rate_limited: stats.rate_limited.load(Ordering::Relaxed),
            uptime_secs: self.inner.started.elapsed().as_secs(),
            routes,
            circuit_breakers: self.inner.breakers.snapshots(),
            rate_limiters,
            mesh: self.mesh().map(|m| m.get_mesh_metrics()),
        }
    }

    /// Drops idle rate-limit windows on every route. Returns how many were removed.
    pub fn sweep_rate_limiters(&self) -> usize {
        self.inner.limiters.iter().map(|l| l.value().sweep()).sum()
    }

    /// Runs [`sweep_rate_limiters`](Self::sweep_rate_limiters) on the configured
    /// interval until `shutdown_rx` fires.
    pub fn spawn_maintenance(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let gateway = self.clone();
        let every = match self.inner.config.sweep_interval {
            d if d.is_zero() => GatewayConfig::default().sweep_interval,
            d => d,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = gateway.sweep_rate_limiters();
                        debug!(removed, "rate limiter sweep");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Per-connection tower service bound to the peer address.
    pub fn service(&self, remote_addr: Option<SocketAddr>) -> GatewayService {
        GatewayService {
            gateway: self.clone(),
            remote_addr,
        }
    }

    /// Handles one inbound request end to end. Never fails; errors become
    /// envelope responses.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let ctx = RequestContext::from_headers(req.headers());
        let span = info_span!(
            "gateway_request",
            correlation_id = %ctx,
            method = %req.method(),
            path = %req.uri().path()
        );
        self.handle_in_span(ctx, req, remote_addr)
            .instrument(span)
            .await
    }

    async fn handle_in_span<B>(
        &self,
        ctx: RequestContext,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let start = Instant::now();
        let method = req.method().clone();
        let mut exchange = Exchange::default();

        let admin = if method == http::Method::GET {
            admin::serve(self, &ctx, req.uri().path()).await
        } else {
            None
        };

        let result = match admin {
            Some(result) => {
                exchange.route = Some("admin".to_string());
                result
            }
            None => self.dispatch(&ctx, req, remote_addr, &mut exchange).await,
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => error_response(&e, &ctx),
        };
        response.headers_mut().extend(exchange.headers);
        if let Ok(id) = HeaderValue::from_str(ctx.correlation_id()) {
            response.headers_mut().insert(CORRELATION_HEADER, id);
        }

        let status = response.status();
        let stats = &self.inner.stats;
        stats.requests.fetch_add(1, Ordering::Relaxed);
        if status.is_client_error() {
            stats.client_errors.fetch_add(1, Ordering::Relaxed);
        } else if status.is_server_error() {
            stats.server_errors.fetch_add(1, Ordering::Relaxed);
        }

        let route = exchange.route.as_deref().unwrap_or("unmatched");
        let upstream = exchange.upstream.as_deref().unwrap_or("none");
        let elapsed = start.elapsed();
        Metrics::record_request(
            route,
            method.as_str(),
            status.as_u16(),
            upstream,
            elapsed.as_secs_f64(),
        );
        info!(
            route,
            upstream,
            status = status.as_u16(),
            duration_ms = elapsed.as_secs_f64() * 1000.0,
            "request completed"
        );
        response
    }

    /// Routes and forwards `req`, returning the upstream response or the error
    /// that the envelope stage renders.
    pub async fn forward<B>(
        &self,
        ctx: &RequestContext,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<GatewayBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut exchange = Exchange::default();
        let mut response = self.dispatch(ctx, req, remote_addr, &mut exchange).await?;
        response.headers_mut().extend(exchange.headers);
        Ok(response)
    }

    async fn dispatch<B>(
        &self,
        ctx: &RequestContext,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
        exchange: &mut Exchange,
    ) -> Result<Response<GatewayBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let matched = self
            .inner
            .router
            .read()
            .route(&parts.method, parts.uri.path(), &parts.headers)
            .ok_or_else(|| MeshError::RouteNotFound {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
            })?;
        let route = Arc::clone(&matched.route);
        exchange.route = Some(route.name.clone());

        let limiter = self
            .inner
            .limiters
            .get(&route.name)
            .map(|l| Arc::clone(l.value()));
        let after_auth = limiter
            .as_ref()
            .is_some_and(|l| l.config().identifier == IdentifierKind::Identity);
        if let Some(limiter) = limiter.as_deref().filter(|_| !after_auth) {
            self.apply_rate_limit(
                &route.name,
                limiter,
                &RequestInfo {
                    headers: &parts.headers,
                    remote_addr: remote_addr.map(|a| a.ip()),
                    identity: None,
                },
                exchange,
            )?;
        }

        let body = read_body(body, self.inner.config.max_body_bytes).await?;
        let mut request = GatewayRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr,
            ctx: ctx.clone(),
            identity: None,
            json: None,
        };

        for middleware in self.inner.middlewares.chain(&route.middlewares)? {
            middleware.handle(&mut request).await?;
        }

        if let Some(limiter) = limiter.as_deref().filter(|_| after_auth) {
            self.apply_rate_limit(
                &route.name,
                limiter,
                &RequestInfo {
                    headers: &request.headers,
                    remote_addr: request.remote_addr.map(|a| a.ip()),
                    identity: request.identity.as_deref(),
                },
                exchange,
            )?;
        }

        let path =
            forward::path_and_query(matched.upstream_path(request.uri.path()), &request.uri);
        let budget = route
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.inner.config.request_timeout);

        match &route.target {
            RouteTarget::Service { service } => {
                self.forward_to_service(&route, service, &path, budget, &request, exchange)
                    .await
            }
            RouteTarget::Static { url } => {
                self.forward_to_static(url, &path, budget, &request, exchange)
                    .await
            }
        }
    }

    fn apply_rate_limit(
        &self,
        route: &str,
        limiter: &RateLimiter,
        info: &RequestInfo<'_>,
        exchange: &mut Exchange,
    ) -> Result<()> {
        let decision = limiter.check(info);
        decision.apply_headers(&mut exchange.headers);
        if decision.allowed {
            return Ok(());
        }
        Metrics::record_rate_limited(route);
        self.inner.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        Err(MeshError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
            limit: decision.limit,
        })
    }

    async fn forward_to_service(
        &self,
        route: &Route,
        service: &str,
        path: &str,
        budget: Duration,
        request: &GatewayRequest,
        exchange: &mut Exchange,
    ) -> Result<Response<GatewayBody>> {
        let instances = self
            .inner
            .registry
            .discover(&request.ctx, service, true)
            .await
            .map_err(|e| {
                MeshError::unavailable(service, UnavailableReason::Upstream(e.to_string()))
            })?;
        if instances.is_empty() {
            warn!(service, "no healthy instances");
            return Err(MeshError::unavailable(
                service,
                UnavailableReason::NoHealthyInstances,
            ));
        }

        let client_ip = request.remote_addr.map(|a| a.ip().to_string());
        let hash_key = route
            .hash_header
            .as_deref()
            .and_then(|h| request.headers.get(h))
            .and_then(|v| v.to_str().ok())
            .or(client_ip.as_deref());
        let instance = self
            .inner
            .balancer
            .select(&instances, service, route.load_balancer, hash_key)
            .ok_or_else(|| MeshError::unavailable(service, UnavailableReason::NoHealthyInstances))?;
        exchange.upstream = Some(instance.id.clone());

        let target = instance.url(path);
        debug!(service, instance = %instance.id, target = %target, "forwarding to instance");
        let upstream = forward::build_upstream_request(request, &target)?;

        let spec = route.circuit_breaker.clone().unwrap_or_default();
        let breaker = self.inner.breakers.get_or_create(service, &spec.to_config());
        let client = &self.inner.client;
        match breaker
            .execute_with_timeout(budget, || client.request(upstream))
            .await
        {
            Ok(response) => Ok(response.map(|b| b.boxed())),
            Err(CircuitBreakerError::Open { .. }) => {
                Metrics::record_circuit_rejection(service);
                Err(MeshError::unavailable(service, UnavailableReason::CircuitOpen))
            }
            Err(CircuitBreakerError::Timeout { duration_ms, .. }) => Err(MeshError::unavailable(
                service,
                UnavailableReason::Timeout { duration_ms },
            )),
            Err(CircuitBreakerError::Inner(e)) => {
                warn!(service, instance = %instance.id, error = %e, "upstream request failed");
                Err(MeshError::unavailable(
                    service,
                    UnavailableReason::Upstream(e.to_string()),
                ))
            }
        }
    }

    async fn forward_to_static(
        &self,
        base: &str,
        path: &str,
        budget: Duration,
        request: &GatewayRequest,
        exchange: &mut Exchange,
    ) -> Result<Response<GatewayBody>> {
        exchange.upstream = Some(base.to_string());
        let target = forward::join_url(base, path);
        let upstream = forward::build_upstream_request(request, &target)?;

        match timeout(budget, self.inner.client.request(upstream)).await {
            Ok(Ok(response)) => Ok(response.map(|b| b.boxed())),
            Ok(Err(e)) => {
                warn!(upstream = %base, error = %e, "static upstream failed");
                Err(MeshError::BadGateway {
                    upstream: base.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => Err(MeshError::Timeout {
                duration_ms: budget.as_millis() as u64,
            }),
        }
    }
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| MeshError::BadRequest(format!("failed to read request body: {}", e)))
}

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(body))
            .unwrap_or_else(|_| Response::new(full_body(Bytes::new()))),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            let mut response = Response::new(full_body("internal error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// Renders `err` as `{ "error": { code, message, correlation_id } }`.
pub fn error_response(err: &MeshError, ctx: &RequestContext) -> Response<GatewayBody> {
    let status = err.status_code();
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        error!(error = %err, code = err.code(), "request failed");
    } else {
        warn!(error = %err, code = err.code(), "request rejected");
    }

    let body = serde_json::json!({
        "error": {
            "code": err.code(),
            "message": err.public_message(),
            "correlation_id": ctx.correlation_id(),
        }
    });
    json_response(status, &body)
}

/// Tower service wrapping a [`GatewayRouter`] for one connection.
#[derive(Clone)]
pub struct GatewayService {
    gateway: GatewayRouter,
    remote_addr: Option<SocketAddr>,
}

impl<B> Service<Request<B>> for GatewayService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<GatewayBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let gateway = self.gateway.clone();
        let remote_addr = self.remote_addr;
        Box::pin(async move { Ok(gateway.handle(req, remote_addr).await) })
    }
}
