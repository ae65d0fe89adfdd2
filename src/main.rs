use rust_meshplane::config::MeshConfig;
use rust_meshplane::config_center::InMemoryConfigCenter;
use rust_meshplane::context::RequestContext;
use rust_meshplane::gateway::{GatewayConfig, GatewayListener, GatewayRouter};
use rust_meshplane::mesh::{MeshManager, MeshOptions};
use rust_meshplane::proxy_config::{ProxyConfigGenerator, ProxyConfigOptions};
use rust_meshplane::registry::{ConsulBackend, ServiceRegistryClient};
use rust_meshplane::router::RoutingConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("MESH_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting Rust Meshplane");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = MeshConfig::from_env_validated()?;
    info!(
        "config: gateway={}, registry={}, proxy_configs={}, timeout={}ms",
        config.listen_addr,
        config.consul.base_url(),
        config.proxy_config_dir.display(),
        config.request_timeout.as_millis()
    );

    let ctx = RequestContext::background("startup");
    let backend = Arc::new(ConsulBackend::new(config.consul.clone())?);
    let registry = Arc::new(ServiceRegistryClient::new(backend));

    let generator = Arc::new(ProxyConfigGenerator::new(
        Arc::clone(&registry),
        ProxyConfigOptions::default()
            .with_output_dir(&config.proxy_config_dir)
            .with_refresh_interval(config.proxy_config_refresh),
    ));
    let mesh = Arc::new(MeshManager::new(
        Arc::clone(&registry),
        Arc::new(InMemoryConfigCenter::new()),
        generator,
        MeshOptions::default()
            .with_health_check_interval(config.health_check_interval)
            .with_metrics_interval(config.metrics_interval),
    ));
    mesh.start(&ctx).await?;

    let gateway = GatewayRouter::new(Arc::clone(&registry), GatewayConfig::from(&config));
    gateway.attach_mesh(Arc::clone(&mesh));
    if let Some(path) = &config.routes_file {
        let loaded = gateway.load_routes(RoutingConfig::from_file(path)?)?;
        info!("loaded {} routes from {}", loaded, path.display());
    }

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let listener = GatewayListener::bind(&config.listen_addr, gateway.clone()).await?;
    info!(
        "gateway listening on {} (/health, /metrics, /admin/services, /admin/gateway/stats)",
        listener.local_addr()
    );

    let maintenance = gateway.spawn_maintenance(shutdown_tx.subscribe());

    let mut gateway_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("gateway listener error: {}", e);
            }
        }
    });

    let mut gateway_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut gateway_task => {
            gateway_finished = true;
            match res {
                Ok(()) => info!("gateway task completed"),
                Err(err) => error!("gateway task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !gateway_finished {
        match gateway_task.await {
            Ok(()) => info!("gateway task completed"),
            Err(err) => error!("gateway task join error: {}", err),
        }
    }
    if let Err(err) = maintenance.await {
        error!("maintenance task join error: {}", err);
    }

    mesh.shutdown().await;
    registry.cleanup(&RequestContext::background("shutdown")).await;

    info!("shutdown complete");
    Ok(())
}
