//! Gateway route table with path, method and header matching.
//!
//! Routes resolve either to a registry-backed service or to a fixed URL and
//! carry their own middleware chain, rate limit and breaker settings.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{MeshError, Result};
use crate::load_balancer::LoadBalancerStrategy;
use crate::ratelimit::{IdentifierKind, RateLimitConfig};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Compiled route and header patterns, shared by every router in the process.
static COMPILED: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

fn compiled(pattern: &str) -> Option<Arc<Regex>> {
    if let Some(hit) = COMPILED.get(pattern) {
        return Some(Arc::clone(hit.value()));
    }
    match Regex::new(pattern) {
        Ok(re) => {
            let re = Arc::new(re);
            COMPILED.insert(pattern.to_owned(), Arc::clone(&re));
            Some(re)
        }
        Err(e) => {
            warn!(pattern, error = %e, "route pattern does not compile, never matches");
            None
        }
    }
}

/// Evaluation order of path matchers; larger values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoutePriority {
    Exact = 100,
    Prefix = 50,
    Regex = 25,
}

/// Predicate over a single request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatch {
    Exact { name: String, value: String },
    /// Substring match on the header value.
    Contains { name: String, value: String },
    Regex { name: String, pattern: String },
    Present { name: String },
    Absent { name: String },
}

impl HeaderMatch {
    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Exact {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn present(name: impl Into<String>) -> Self {
        Self::Present { name: name.into() }
    }

    pub fn absent(name: impl Into<String>) -> Self {
        Self::Absent { name: name.into() }
    }

    pub fn matches(&self, headers: &http::HeaderMap) -> bool {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        match self {
            HeaderMatch::Exact { name, value } => {
                headers.get(name.as_str()).is_some_and(|v| v == value.as_str())
            }
            HeaderMatch::Contains { name, value } => {
                text(name).is_some_and(|v| v.contains(value.as_str()))
            }
            HeaderMatch::Regex { name, pattern } => match (compiled(pattern), text(name)) {
                (Some(re), Some(v)) => re.is_match(v),
                _ => false,
            },
            HeaderMatch::Present { name } => headers.contains_key(name.as_str()),
            HeaderMatch::Absent { name } => !headers.contains_key(name.as_str()),
        }
    }
}

/// Predicate over the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatch {
    Exact { path: String },
    Prefix { prefix: String },
    Regex { pattern: String },
}

impl PathMatch {
    pub fn exact(path: impl Into<String>) -> Self {
        Self::Exact { path: path.into() }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix {
            prefix: prefix.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex {
            pattern: pattern.into(),
        }
    }

    /// Interprets a mount path: `^...` is a regex, `=/x` is exact, anything
    /// else (with an optional trailing `*`) is a prefix.
    pub fn from_pattern(pattern: &str) -> Self {
        if pattern.starts_with('^') {
            Self::regex(pattern)
        } else if let Some(exact) = pattern.strip_prefix('=') {
            Self::exact(exact)
        } else {
            Self::prefix(pattern.trim_end_matches('*'))
        }
    }

    /// Length of the literal part, used to prefer more specific prefixes.
    fn specificity(&self) -> usize {
        match self {
            PathMatch::Exact { path } => path.len(),
            PathMatch::Prefix { prefix } => prefix.len(),
            PathMatch::Regex { .. } => 0,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact { path: want } => path == want,
            PathMatch::Prefix { prefix } => path.starts_with(prefix.as_str()),
            PathMatch::Regex { pattern } => compiled(pattern).is_some_and(|re| re.is_match(path)),
        }
    }

    pub fn priority(&self) -> RoutePriority {
        match self {
            PathMatch::Exact { .. } => RoutePriority::Exact,
            PathMatch::Prefix { .. } => RoutePriority::Prefix,
            PathMatch::Regex { .. } => RoutePriority::Regex,
        }
    }
}

/// Request method a route accepts. Unset means any.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MethodMatch {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    #[default]
    Any,
}

impl MethodMatch {
    /// Parses a method name; `*` and `ANY` match everything.
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(MethodMatch::Get),
            "POST" => Some(MethodMatch::Post),
            "PUT" => Some(MethodMatch::Put),
            "DELETE" => Some(MethodMatch::Delete),
            "PATCH" => Some(MethodMatch::Patch),
            "HEAD" => Some(MethodMatch::Head),
            "OPTIONS" => Some(MethodMatch::Options),
            "ANY" | "*" => Some(MethodMatch::Any),
            _ => None,
        }
    }

    pub fn matches(&self, method: &http::Method) -> bool {
        use http::Method;
        let want = match self {
            MethodMatch::Any => return true,
            MethodMatch::Get => Method::GET,
            MethodMatch::Post => Method::POST,
            MethodMatch::Put => Method::PUT,
            MethodMatch::Delete => Method::DELETE,
            MethodMatch::Patch => Method::PATCH,
            MethodMatch::Head => Method::HEAD,
            MethodMatch::Options => Method::OPTIONS,
        };
        *method == want
    }
}

/// Where a matched request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    /// Resolved through the registry on every request.
    Service { service: String },
    /// Fixed base URL; no registry lookup and no circuit breaker.
    Static { url: String },
}

impl RouteTarget {
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service {
            service: name.into(),
        }
    }

    pub fn fixed(url: impl Into<String>) -> Self {
        Self::Static { url: url.into() }
    }

    /// Service name or URL, used for labels and logs.
    pub fn label(&self) -> &str {
        match self {
            RouteTarget::Service { service } => service,
            RouteTarget::Static { url } => url,
        }
    }
}

/// Per-route rate limit as written in a routing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub max_requests: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub identifier: IdentifierKind,
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_window_ms() -> u64 {
    60_000
}

impl RateLimitSpec {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: window.as_millis() as u64,
            identifier: IdentifierKind::SourceAddress,
            trust_forwarded_for: false,
        }
    }

    pub fn with_identifier(mut self, identifier: IdentifierKind) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.max_requests, Duration::from_millis(self.window_ms))
            .with_identifier(self.identifier.clone())
            .with_trust_forwarded_for(self.trust_forwarded_for)
    }
}

/// Per-route breaker overrides as written in a routing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSpec {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u64 {
    2
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerSpec {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.reset_timeout_ms))
            .with_success_threshold(self.success_threshold)
    }
}

/// A single routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Unique name for this route.
    pub name: String,
    /// Path matching condition.
    pub path: PathMatch,
    /// HTTP method matching (optional, defaults to Any).
    #[serde(default)]
    pub method: MethodMatch,
    /// Header matching conditions (all must match).
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    pub target: RouteTarget,
    /// Middleware names, run in order after the global chain.
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    #[serde(default)]
    pub load_balancer: LoadBalancerStrategy,
    /// Header whose value feeds consistent hashing.
    #[serde(default)]
    pub hash_header: Option<String>,
    /// Disabled routes stay in the table but never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Forwarding budget; the gateway default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Replacement for the matched prefix (or the whole path for exact/regex).
    #[serde(default)]
    pub rewrite: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Route {
    pub fn new(name: impl Into<String>, path: PathMatch, target: RouteTarget) -> Self {
        Self {
            name: name.into(),
            path,
            method: MethodMatch::Any,
            headers: Vec::new(),
            target,
            middlewares: Vec::new(),
            rate_limit: None,
            circuit_breaker: None,
            load_balancer: LoadBalancerStrategy::RoundRobin,
            hash_header: None,
            enabled: true,
            timeout_ms: None,
            rewrite: None,
        }
    }

    pub fn with_method(mut self, method: MethodMatch) -> Self {
        self.method = method;
        self
    }

    /// All header predicates must hold for the route to match.
    pub fn with_header(mut self, predicate: HeaderMatch) -> Self {
        self.headers.push(predicate);
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
        self.load_balancer = strategy;
        self
    }

    pub fn with_hash_header(mut self, header: impl Into<String>) -> Self {
        self.hash_header = Some(header.into());
        self
    }

    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout_ms = Some(millis);
        self
    }

    pub fn with_rewrite(mut self, replacement: impl Into<String>) -> Self {
        self.rewrite = Some(replacement.into());
        self
    }

    /// Rejects malformed routes before they reach the table.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::Validation("route name is required".into()));
        }
        match &self.path {
            PathMatch::Regex { pattern } if compiled(pattern).is_none() => {
                return Err(MeshError::Validation(format!(
                    "route {} has an invalid path pattern",
                    self.name
                )));
            }
            PathMatch::Exact { path } | PathMatch::Prefix { prefix: path }
                if !path.starts_with('/') =>
            {
                return Err(MeshError::Validation(format!(
                    "route {} path must start with '/'",
                    self.name
                )));
            }
            _ => {}
        }
        match &self.target {
            RouteTarget::Service { service } if service.trim().is_empty() => {
                return Err(MeshError::Validation(format!(
                    "route {} has an empty service name",
                    self.name
                )));
            }
            RouteTarget::Static { url } => {
                let parsed = url::Url::parse(url).map_err(|e| {
                    MeshError::Validation(format!("route {} target {}: {}", self.name, url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(MeshError::Validation(format!(
                        "route {} target must be http(s)",
                        self.name
                    )));
                }
            }
            _ => {}
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max_requests == 0 || limit.window_ms == 0 {
                return Err(MeshError::Validation(format!(
                    "route {} rate limit needs max_requests and window_ms above zero",
                    self.name
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, method: &http::Method, path: &str, headers: &http::HeaderMap) -> bool {
        self.enabled
            && self.method.matches(method)
            && self.path.matches(path)
            && self.headers.iter().all(|h| h.matches(headers))
    }

    pub fn priority(&self) -> RoutePriority {
        self.path.priority()
    }
}

/// A route selected for one request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// Upstream path after applying the route's rewrite, if it has one.
    pub rewritten_path: Option<String>,
}

impl RouteMatch {
    /// Path to send upstream.
    pub fn upstream_path<'a>(&'a self, original: &'a str) -> &'a str {
        self.rewritten_path.as_deref().unwrap_or(original)
    }
}

/// Ordered route table.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(routes: Vec<Route>) -> Self {
        let mut router = Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        };
        router.sort_routes();
        router
    }

    /// Adds a route, replacing any existing route with the same name.
    pub fn add_route(&mut self, route: Route) {
        self.routes.retain(|r| r.name != route.name);
        self.routes.push(Arc::new(route));
        self.sort_routes();
    }

    pub fn remove_route(&mut self, name: &str) -> Option<Arc<Route>> {
        let idx = self.routes.iter().position(|r| r.name == name)?;
        Some(self.routes.remove(idx))
    }

    /// Sorts by priority, then by literal length, both descending. Stable, so
    /// registration order breaks remaining ties.
    fn sort_routes(&mut self) {
        self.routes.sort_by_key(|r| {
            std::cmp::Reverse((r.priority(), r.path.specificity()))
        });
    }

    /// First route in priority order that accepts the request.
    pub fn route(
        &self,
        method: &http::Method,
        path: &str,
        headers: &http::HeaderMap,
    ) -> Option<RouteMatch> {
        let route = self.routes.iter().find(|r| r.matches(method, path, headers))?;
        debug!(route = %route.name, target = %route.target.label(), "matched route");

        let rewritten_path = route.rewrite.as_ref().map(|rewrite| {
            if let PathMatch::Prefix { prefix } = &route.path {
                let rest = path.strip_prefix(prefix.as_str()).unwrap_or(path);
                let joined = format!("{}{}", rewrite, rest);
                if joined.starts_with('/') {
                    joined
                } else {
                    format!("/{}", joined)
                }
            } else {
                rewrite.clone()
            }
        });

        Some(RouteMatch {
            route: Arc::clone(route),
            rewritten_path,
        })
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route table as declared in a routing file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Middleware names applied to every route before its own chain.
    #[serde(default)]
    pub global_middlewares: Vec<String>,
}

impl RoutingConfig {
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(content)
    }

    /// Loads a `.json` or `.toml` routing file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content)?,
            _ => Self::from_toml(&content).map_err(|e| {
                MeshError::InvalidConfig(format!("{}: {}", path.display(), e))
            })?,
        };
        for route in &config.routes {
            route.validate()?;
        }
        Ok(config)
    }
}
