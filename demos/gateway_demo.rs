//! Gateway and mesh demonstration.
//!
//! Starts two in-process backends, registers them with an in-memory mesh,
//! mounts them behind the gateway and sends a handful of requests through it.
//! Generated sidecar configs land in a temporary directory.
//!
//! Run with:
//! ```bash
//! cargo run --example gateway_demo
//! ```

use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rust_meshplane::config_center::InMemoryConfigCenter;
use rust_meshplane::context::RequestContext;
use rust_meshplane::gateway::{
    BearerAuth, GatewayConfig, GatewayListener, GatewayRouter, ServiceRouteOptions,
};
use rust_meshplane::mesh::{MeshManager, MeshOptions};
use rust_meshplane::proxy_config::{ProxyConfigGenerator, ProxyConfigOptions};
use rust_meshplane::registry::{InMemoryRegistry, ServiceDescriptor, ServiceRegistryClient};
use rust_meshplane::router::RateLimitSpec;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let ctx = RequestContext::background("demo");
    let config_dir = std::env::temp_dir().join("meshplane-demo");

    let registry = Arc::new(ServiceRegistryClient::new(Arc::new(InMemoryRegistry::new())));
    let generator = Arc::new(ProxyConfigGenerator::new(
        Arc::clone(&registry),
        ProxyConfigOptions::default().with_output_dir(&config_dir),
    ));
    let mesh = Arc::new(MeshManager::new(
        Arc::clone(&registry),
        Arc::new(InMemoryConfigCenter::new()),
        generator,
        MeshOptions::default().with_health_check_interval(Duration::from_secs(5)),
    ));
    mesh.start(&ctx).await?;

    for (id, name) in [("orders-1", "alpha"), ("orders-2", "beta")] {
        let port = start_backend(name).await?;
        mesh.register_service(
            &ctx,
            ServiceDescriptor::new("orders", "1.0.0")
                .with_id(id)
                .with_http_port(port),
        )
        .await?;
    }
    mesh.check_service_health(&ctx, None).await?;
    info!(dir = %config_dir.display(), "sidecar configs written");

    let gateway = GatewayRouter::new(Arc::clone(&registry), GatewayConfig::default());
    gateway.attach_mesh(Arc::clone(&mesh));
    gateway.register_middleware(
        "auth",
        BearerAuth::new().with_token("demo-token", "demo-user"),
    );
    gateway.register_service_route(
        "/api/orders/*",
        "orders",
        ServiceRouteOptions::default()
            .with_rewrite("/")
            .with_middleware("auth")
            .with_rate_limit(RateLimitSpec::new(5, Duration::from_secs(10))),
    )?;

    let listener = GatewayListener::bind("127.0.0.1:0", gateway.clone()).await?;
    let addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = tokio::spawn(listener.serve(shutdown_rx));

    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    for i in 1..=7 {
        let req = Request::builder()
            .uri(format!("http://{}/api/orders/{}", addr, i))
            .header("authorization", "Bearer demo-token")
            .body(Empty::<Bytes>::new())?;
        let response = client.request(req).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        info!(
            request = i,
            status = status.as_u16(),
            body = %String::from_utf8_lossy(&body),
            "response"
        );
    }

    let unauthenticated = Request::builder()
        .uri(format!("http://{}/api/orders/1", addr))
        .body(Empty::<Bytes>::new())?;
    let response = client.request(unauthenticated).await?;
    info!(status = response.status().as_u16(), "request without token");

    let stats = serde_json::to_string_pretty(&gateway.stats())?;
    info!("gateway stats:\n{}", stats);

    let _ = shutdown_tx.send(());
    server.await??;
    mesh.shutdown().await;
    registry.cleanup(&ctx).await;
    info!("Demo complete!");
    Ok(())
}

async fn start_backend(name: &'static str) -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let body = format!("{} handled {}", name, req.uri().path());
                    Ok::<_, Infallible>(Response::new(body))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Ok(port)
}
