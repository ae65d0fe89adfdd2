//! Management endpoints served on the gateway listener.
//!
//! Serves:
//! - `/health` - overall status plus per-circuit-breaker state
//! - `/metrics` - Prometheus metrics in text format
//! - `/admin/services` - services known to the mesh (or the registry)
//! - `/admin/gateway/stats` - gateway counters, breakers and mesh metrics
//!
//! All responses are read-only JSON except `/metrics`.

use super::{full_body, json_response, GatewayBody, GatewayRouter};
use crate::circuit_breaker::State;
use crate::context::RequestContext;
use crate::error::Result;
use crate::metrics::Metrics;
use chrono::Utc;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use serde_json::json;
use tracing::debug;

const HEALTH_PATH: &str = "/health";
const METRICS_PATH: &str = "/metrics";
const SERVICES_PATH: &str = "/admin/services";
const STATS_PATH: &str = "/admin/gateway/stats";

/// Answers `path` if it is a management endpoint, otherwise returns `None`.
pub(crate) async fn serve(
    gateway: &GatewayRouter,
    ctx: &RequestContext,
    path: &str,
) -> Option<Result<Response<GatewayBody>>> {
    let response = match path {
        HEALTH_PATH => Ok(health(gateway)),
        METRICS_PATH => metrics(),
        SERVICES_PATH => services(gateway, ctx).await,
        STATS_PATH => Ok(json_response(StatusCode::OK, &gateway.stats())),
        _ => return None,
    };
    debug!(path, "management endpoint served");
    Some(response)
}

fn health(gateway: &GatewayRouter) -> Response<GatewayBody> {
    let breakers = gateway.circuit_breaker_states();
    let open = breakers
        .values()
        .filter(|b| b.state == State::Open)
        .count();
    let mesh = gateway.mesh().map(|m| m.get_mesh_status());

    json_response(
        StatusCode::OK,
        &json!({
            "status": if open == 0 { "ok" } else { "degraded" },
            "timestamp": Utc::now(),
            "circuit_breakers": breakers,
            "mesh": mesh,
        }),
    )
}

fn metrics() -> Result<Response<GatewayBody>> {
    let encoded = Metrics::encode()?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(full_body(encoded))?)
}

async fn services(gateway: &GatewayRouter, ctx: &RequestContext) -> Result<Response<GatewayBody>> {
    let services = match gateway.mesh() {
        Some(mesh) => serde_json::to_value(mesh.list_services(ctx).await?)?,
        None => {
            let registry = gateway.registry();
            let mut out = Vec::new();
            for name in registry.list_services(ctx).await? {
                let instances = registry.discover(ctx, &name, false).await?;
                out.push(json!({ "name": name, "instances": instances }));
            }
            serde_json::Value::Array(out)
        }
    };
    let count = services.as_array().map(Vec::len).unwrap_or(0);
    Ok(json_response(
        StatusCode::OK,
        &json!({ "count": count, "services": services }),
    ))
}
