//! Process-wide Prometheus registry for the gateway and the mesh manager.
//!
//! Served as text at `GET /metrics`.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Route name, or "unmatched".
    pub route: String,
    pub method: String,
    pub status: String,
    /// Instance id for service routes, target URL for static ones.
    pub upstream: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

static METRICS: Lazy<Mutex<Metrics>> = Lazy::new(|| Mutex::new(Metrics::new()));

/// Metric families. All access goes through the associated functions.
pub struct Metrics {
    registry: Registry,
    requests: Family<RequestLabels, Counter>,
    latency: Family<RequestLabels, Histogram>,
    rate_limited: Family<RouteLabels, Counter>,
    circuit_rejections: Family<ServiceLabels, Counter>,
    services_total: Gauge,
    services_healthy: Gauge,
    services_unhealthy: Gauge,
    endpoints_total: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests = Family::<RequestLabels, Counter>::default();
        let latency = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            // 1ms .. ~0.5s
            Histogram::new(exponential_buckets(0.001, 2.0, 10))
        });
        let rate_limited = Family::<RouteLabels, Counter>::default();
        let circuit_rejections = Family::<ServiceLabels, Counter>::default();

        registry.register(
            "gateway_requests",
            "Requests answered by the gateway",
            requests.clone(),
        );
        registry.register(
            "gateway_request_duration_seconds",
            "Time from accept to response, forwarding included",
            latency.clone(),
        );
        registry.register(
            "gateway_rate_limited",
            "Requests denied by a route rate limiter",
            rate_limited.clone(),
        );
        registry.register(
            "gateway_circuit_rejections",
            "Requests failed fast by an open circuit breaker",
            circuit_rejections.clone(),
        );

        let mesh = registry.sub_registry_with_prefix("mesh");
        let services_total = gauge(mesh, "services_total", "Services known to the mesh manager");
        let services_healthy = gauge(
            mesh,
            "services_healthy",
            "Services in HEALTHY or DEGRADED state",
        );
        let services_unhealthy = gauge(
            mesh,
            "services_unhealthy",
            "Services with no passing instance",
        );
        let endpoints_total = gauge(
            mesh,
            "endpoints_total",
            "Discovered instances across all services",
        );

        Self {
            registry,
            requests,
            latency,
            rate_limited,
            circuit_rejections,
            services_total,
            services_healthy,
            services_unhealthy,
            endpoints_total,
        }
    }

    pub fn record_request(route: &str, method: &str, status: u16, upstream: &str, secs: f64) {
        let labels = RequestLabels {
            route: route.to_owned(),
            method: method.to_owned(),
            status: status.to_string(),
            upstream: upstream.to_owned(),
        };
        let m = METRICS.lock();
        m.requests.get_or_create(&labels).inc();
        m.latency.get_or_create(&labels).observe(secs);
    }

    pub fn record_rate_limited(route: &str) {
        let labels = RouteLabels {
            route: route.to_owned(),
        };
        METRICS.lock().rate_limited.get_or_create(&labels).inc();
    }

    pub fn record_circuit_rejection(service: &str) {
        let labels = ServiceLabels {
            service: service.to_owned(),
        };
        METRICS.lock().circuit_rejections.get_or_create(&labels).inc();
    }

    /// Publishes the aggregates computed by the mesh metrics loop.
    pub fn set_mesh_totals(total: usize, healthy: usize, unhealthy: usize, endpoints: usize) {
        let as_i64 = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        let m = METRICS.lock();
        m.services_total.set(as_i64(total));
        m.services_healthy.set(as_i64(healthy));
        m.services_unhealthy.set(as_i64(unhealthy));
        m.endpoints_total.set(as_i64(endpoints));
    }

    /// Renders every family in the Prometheus text exposition format.
    pub fn encode() -> Result<String, io::Error> {
        let mut out = String::new();
        encode(&mut out, &METRICS.lock().registry)
            .map_err(|e| io::Error::other(format!("metrics encoding failed: {}", e)))?;
        Ok(out)
    }
}

fn gauge(registry: &mut Registry, name: &str, help: &str) -> Gauge {
    let gauge = Gauge::default();
    registry.register(name, help, gauge.clone());
    gauge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counter_and_latency() {
        Metrics::record_request("orders", "GET", 200, "orders-1", 0.05);
        Metrics::record_request("orders", "POST", 201, "orders-2", 0.1);

        let text = Metrics::encode().unwrap();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("gateway_request_duration_seconds_bucket"));
        assert!(text.contains("route=\"orders\""));
        assert!(text.contains("upstream=\"orders-2\""));
    }

    #[test]
    fn test_rejection_counters() {
        Metrics::record_rate_limited("limited-route");
        Metrics::record_circuit_rejection("flaky-service");

        let text = Metrics::encode().unwrap();
        assert!(text.contains("gateway_rate_limited_total{route=\"limited-route\"}"));
        assert!(text.contains("gateway_circuit_rejections_total{service=\"flaky-service\"}"));
    }

    #[test]
    fn test_mesh_gauges_are_prefixed() {
        Metrics::set_mesh_totals(3, 2, 1, 7);
        let text = Metrics::encode().unwrap();
        assert!(text.contains("mesh_services_total"));
        assert!(text.contains("mesh_services_unhealthy"));
        assert!(text.contains("mesh_endpoints_total"));
    }
}
