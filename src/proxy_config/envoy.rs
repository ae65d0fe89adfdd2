//! Sidecar bootstrap document model.
//!
//! These types serialize to the static bootstrap JSON the sidecar reads:
//! `static_resources.listeners`, `static_resources.clusters`, plus the two
//! resource-list documents referenced from `dynamic_resources`. Field order
//! is fixed by declaration order, so equal inputs give byte-equal output.

use crate::load_balancer::LoadBalancerStrategy;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
pub const HTTP_CONNECTION_MANAGER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const ROUTER_FILTER: &str = "envoy.filters.http.router";
pub const ROUTER_FILTER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub const FILE_ACCESS_LOG: &str = "envoy.access_loggers.file";
pub const FILE_ACCESS_LOG_TYPE: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";
pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

pub const ACCESS_LOG_FORMAT: &str = "%LOCAL_REMOTE_ADDRESS% %REQ(:METHOD)% %REQ(X-ENVOY-ORIGINAL-PATH?:PATH)% %PROTOCOL% %RESPONSE_CODE% %RESPONSE_FLAGS% %BYTES_RECEIVED% %BYTES_SENT% %DURATION% %REQ(X-FORWARDED-FOR)% %REQ(USER-AGENT)% %REQ(:AUTHORITY)% %UPSTREAM_HOST%\n";

/// Loopback endpoint used when a cluster has no discovered instance yet.
pub const PLACEHOLDER_ADDRESS: &str = "127.0.0.1";
pub const PLACEHOLDER_PORT: u16 = 8080;

/// Renders a duration in the sidecar's `"<seconds>s"` notation, e.g. `0.25s`.
pub fn duration_string(duration: Duration) -> String {
    format!("{}s", duration.as_secs_f64())
}

pub fn lb_policy(strategy: LoadBalancerStrategy) -> &'static str {
    match strategy {
        LoadBalancerStrategy::RoundRobin => "ROUND_ROBIN",
        LoadBalancerStrategy::Random => "RANDOM",
        LoadBalancerStrategy::LeastConnections => "LEAST_REQUEST",
        LoadBalancerStrategy::ConsistentHash => "RING_HASH",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub static_resources: StaticResources,
    pub admin: Admin,
    pub dynamic_resources: DynamicResources,
    pub stats_flush_interval: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticResources {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    pub access_log_path: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicResources {
    pub cds_config: PathConfigSource,
    pub lds_config: PathConfigSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfigSource {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

impl Address {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            socket_address: SocketAddress {
                address: address.into(),
                port_value: port,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    pub filter_chains: Vec<FilterChain>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterChain {
    pub filters: Vec<NetworkFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFilter {
    pub name: String,
    pub typed_config: HttpConnectionManager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConnectionManager {
    #[serde(rename = "@type")]
    pub type_url: String,
    pub stat_prefix: String,
    pub route_config: RouteConfiguration,
    pub http_filters: Vec<HttpFilter>,
    pub access_log: Vec<AccessLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    #[serde(rename = "match")]
    pub route_match: PrefixMatch,
    pub route: RouteAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixMatch {
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAction {
    pub cluster: String,
    pub timeout: String,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub retry_back_off: RetryBackOff,
    pub retriable_status_codes: Vec<u16>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retry_on: config.retry_on_header(),
            num_retries: config.max_retries,
            retry_back_off: RetryBackOff {
                base_interval: duration_string(config.base_delay),
                max_interval: duration_string(config.max_delay),
            },
            retriable_status_codes: config.sidecar_status_codes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackOff {
    pub base_interval: String,
    pub max_interval: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFilter {
    pub name: String,
    pub typed_config: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    #[serde(rename = "@type")]
    pub type_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub name: String,
    pub typed_config: FileAccessLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccessLog {
    #[serde(rename = "@type")]
    pub type_url: String,
    pub path: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFormat {
    pub text_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub connect_timeout: String,
    pub lb_policy: String,
    pub health_checks: Vec<HealthCheck>,
    pub circuit_breakers: CircuitBreakers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_protocol_options: Option<EmptyObject>,
    pub load_assignment: LoadAssignment,
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub timeout: String,
    pub interval: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub http_health_check: HttpHealthCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHealthCheck {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub thresholds: Vec<Thresholds>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityLbEndpoints {
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: Address,
}

/// A resource-list document (`{"resources": [...]}`) for dynamic listeners or clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList<T> {
    pub resources: Vec<TypedResource<T>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedResource<T> {
    #[serde(rename = "@type")]
    pub type_url: String,
    #[serde(flatten)]
    pub resource: T,
}

impl<T: Clone> ResourceList<T> {
    pub fn new(type_url: &str, resources: &[T]) -> Self {
        Self {
            resources: resources
                .iter()
                .map(|r| TypedResource {
                    type_url: type_url.to_string(),
                    resource: r.clone(),
                })
                .collect(),
        }
    }
}

/// Inputs for one HTTP listener.
#[derive(Debug, Clone)]
pub struct ListenerSpec<'a> {
    pub service: &'a str,
    pub listen_address: &'a str,
    pub port: u16,
    pub route_timeout: Duration,
    pub retry: &'a RetryConfig,
    pub access_log_path: &'a str,
}

impl ListenerSpec<'_> {
    pub fn build(&self) -> Listener {
        let service = self.service;
        Listener {
            name: format!("{}-http-listener", service),
            address: Address::new(self.listen_address, self.port),
            filter_chains: vec![FilterChain {
                filters: vec![NetworkFilter {
                    name: HTTP_CONNECTION_MANAGER.to_string(),
                    typed_config: HttpConnectionManager {
                        type_url: HTTP_CONNECTION_MANAGER_TYPE.to_string(),
                        stat_prefix: format!("{}-http", service),
                        route_config: RouteConfiguration {
                            name: format!("{}-http-route", service),
                            virtual_hosts: vec![VirtualHost {
                                name: format!("{}-host", service),
                                domains: vec!["*".to_string()],
                                routes: vec![RouteEntry {
                                    route_match: PrefixMatch {
                                        prefix: "/".to_string(),
                                    },
                                    route: RouteAction {
                                        cluster: cluster_name(service),
                                        timeout: duration_string(self.route_timeout),
                                        retry_policy: RetryPolicy::from(self.retry),
                                    },
                                }],
                            }],
                        },
                        http_filters: vec![HttpFilter {
                            name: ROUTER_FILTER.to_string(),
                            typed_config: TypeRef {
                                type_url: ROUTER_FILTER_TYPE.to_string(),
                            },
                        }],
                        access_log: vec![AccessLog {
                            name: FILE_ACCESS_LOG.to_string(),
                            typed_config: FileAccessLog {
                                type_url: FILE_ACCESS_LOG_TYPE.to_string(),
                                path: self.access_log_path.to_string(),
                                log_format: LogFormat {
                                    text_format: ACCESS_LOG_FORMAT.to_string(),
                                },
                            },
                        }],
                    },
                }],
            }],
        }
    }
}

pub fn cluster_name(service: &str) -> String {
    format!("{}-cluster", service)
}

/// Inputs for one cluster.
#[derive(Debug, Clone)]
pub struct ClusterSpec<'a> {
    pub service: &'a str,
    pub strategy: LoadBalancerStrategy,
    pub health_check_path: &'a str,
    /// `(address, port)` pairs; an empty list gets the loopback placeholder.
    pub endpoints: Vec<(String, u16)>,
    pub http2: bool,
}

impl ClusterSpec<'_> {
    pub fn build(&self) -> Cluster {
        let name = cluster_name(self.service);
        let mut endpoints = self.endpoints.clone();
        endpoints.sort();
        endpoints.dedup();
        if endpoints.is_empty() {
            endpoints.push((PLACEHOLDER_ADDRESS.to_string(), PLACEHOLDER_PORT));
        }

        Cluster {
            name: name.clone(),
            connect_timeout: "5s".to_string(),
            lb_policy: lb_policy(self.strategy).to_string(),
            health_checks: vec![HealthCheck {
                timeout: "2s".to_string(),
                interval: "10s".to_string(),
                unhealthy_threshold: 3,
                healthy_threshold: 2,
                http_health_check: HttpHealthCheck {
                    path: self.health_check_path.to_string(),
                },
            }],
            circuit_breakers: CircuitBreakers {
                thresholds: vec![Thresholds {
                    max_connections: 1024,
                    max_pending_requests: 1024,
                    max_requests: 1024,
                    max_retries: 3,
                }],
            },
            http2_protocol_options: self.http2.then(EmptyObject::default),
            load_assignment: LoadAssignment {
                cluster_name: name,
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: endpoints
                        .into_iter()
                        .map(|(address, port)| LbEndpoint {
                            endpoint: Endpoint {
                                address: Address::new(address, port),
                            },
                        })
                        .collect(),
                }],
            },
        }
    }
}
