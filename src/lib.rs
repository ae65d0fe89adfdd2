//! Rust Meshplane - service mesh control plane
//!
//! Registers services with a Consul-compatible registry, fronts them with a
//! registry-aware API gateway (load balancing, rate limiting, circuit
//! breaking), tracks mesh health and renders per-service Envoy sidecar
//! configuration.

pub mod circuit_breaker;
pub mod config;
pub mod config_center;
pub mod context;
pub mod error;
pub mod events;
pub mod gateway;
pub mod load_balancer;
pub mod mesh;
pub mod metrics;
pub mod proxy_config;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod router;
