use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use rust_meshplane::config_center::InMemoryConfigCenter;
use rust_meshplane::context::RequestContext;
use rust_meshplane::events::MeshEvent;
use rust_meshplane::gateway::{GatewayConfig, GatewayRouter};
use rust_meshplane::mesh::{MeshManager, MeshOptions, MeshServiceStatus};
use rust_meshplane::proxy_config::{ProxyConfigGenerator, ProxyConfigOptions};
use rust_meshplane::registry::{
    HealthState, InMemoryRegistry, ServiceDescriptor, ServiceRegistryClient,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

struct Mesh {
    dir: TempDir,
    backend: Arc<InMemoryRegistry>,
    registry: Arc<ServiceRegistryClient>,
    config_center: Arc<InMemoryConfigCenter>,
    mesh: Arc<MeshManager>,
}

fn mesh(options: MeshOptions) -> Mesh {
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
        Arc::clone(&registry),
        config_center.clone(),
        generator,
        options,
    ));
    Mesh {
        dir,
        backend,
        registry,
        config_center,
        mesh,
    }
}

fn without_loops() -> MeshOptions {
    MeshOptions::default()
        .with_health_check_interval(Duration::ZERO)
        .with_metrics_interval(Duration::ZERO)
}

async fn next_event<F>(rx: &mut broadcast::Receiver<MeshEvent>, mut pred: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for mesh event")
}

#[tokio::test]
async fn test_service_lifecycle_through_mesh() {
    let m = mesh(without_loops());
    let ctx = RequestContext::new();

    m.mesh
        .register_service(
            &ctx,
            ServiceDescriptor::new("payment-service", "2.1.0")
                .with_id("payment-1")
                .with_http_port(8003),
        )
        .await
        .unwrap();
    let registration = m
        .mesh
        .register_service(
            &ctx,
            ServiceDescriptor::new("order-service", "1.0.0")
                .with_id("order-1")
                .with_http_port(8002)
                .with_dependency("payment-service"),
        )
        .await
        .unwrap();
    assert!(registration.success);
    assert_eq!(registration.service_id, "order-1");
    assert_eq!(registration.service.status, MeshServiceStatus::Registered);

    let config_path = m.dir.path().join("order-service.json");
    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&config_path).unwrap()).unwrap();
    assert_eq!(
        doc["static_resources"]["listeners"][0]["address"]["socket_address"]["port_value"],
        8002
    );
    let clusters: Vec<&str> = doc["static_resources"]["clusters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(clusters, vec!["order-service-cluster", "payment-service-cluster"]);

    let reports = m.mesh.check_service_health(&ctx, None).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.values().all(|r| r.status == MeshServiceStatus::Healthy));
    let metrics = m.mesh.get_mesh_metrics();
    assert_eq!(metrics.total_services, 2);
    assert_eq!(metrics.healthy_services, 2);
    assert_eq!(metrics.total_endpoints, 2);

    assert!(m.mesh.deregister_service(&ctx, "order-service").await.unwrap());
    assert!(m
        .registry
        .discover(&ctx, "order-service", false)
        .await
        .unwrap()
        .is_empty());
    let order = m
        .mesh
        .get_service(&ctx, "order-service")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, MeshServiceStatus::Deregistered);
    assert!(order.deregistration_time.is_some());
    assert!(!config_path.exists());

    let metrics = m.mesh.get_mesh_metrics();
    assert_eq!(metrics.total_services, 1);
    assert_eq!(metrics.total_endpoints, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_mesh_reacts_to_health_and_config_changes() {
    let m = mesh(
        MeshOptions::default()
            .with_health_check_interval(Duration::from_millis(50))
            .with_metrics_interval(Duration::from_millis(50))
            .with_watch_key("gateway/routes"),
    );
    let ctx = RequestContext::new();
    m.registry
        .register(
            &ctx,
            ServiceDescriptor::new("inventory", "3.0.0")
                .with_id("inventory-1")
                .with_http_port(8100),
        )
        .await
        .unwrap();

    m.mesh.start(&ctx).await.unwrap();
    assert!(m.mesh.is_running());
    let inventory = m.mesh.get_service(&ctx, "inventory").await.unwrap().unwrap();
    assert_eq!(inventory.status, MeshServiceStatus::Healthy);

    let mut rx = m.mesh.events().subscribe();

    m.config_center.set("gateway/routes", "v2");
    let event = next_event(&mut rx, |e| matches!(e, MeshEvent::ConfigUpdated { .. })).await;
    match event {
        MeshEvent::ConfigUpdated { key, value, .. } => {
            assert_eq!(key, "gateway/routes");
            assert_eq!(value.as_deref(), Some("v2"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    m.backend.set_instance_health("inventory-1", HealthState::Critical);
    let event = next_event(&mut rx, |e| {
        matches!(e, MeshEvent::ServiceHealthChanged { .. })
    })
    .await;
    match event {
        MeshEvent::ServiceHealthChanged {
            service_name,
            old_status,
            new_status,
            healthy_count,
            total_count,
            ..
        } => {
            assert_eq!(service_name, "inventory");
            assert_eq!(old_status, MeshServiceStatus::Healthy);
            assert_eq!(new_status, MeshServiceStatus::Unhealthy);
            assert_eq!((healthy_count, total_count), (0, 1));
        }
        other => panic!("unexpected event {:?}", other),
    }

    m.mesh.shutdown().await;
    assert!(!m.mesh.is_running());
    assert_eq!(m.mesh.get_mesh_status().status, "stopped");
}

#[tokio::test]
async fn test_gateway_reports_mesh_state() {
    let m = mesh(without_loops());
    let ctx = RequestContext::new();
    m.mesh
        .register_service(
            &ctx,
            ServiceDescriptor::new("catalog", "1.4.0")
                .with_id("catalog-1")
                .with_http_port(8200),
        )
        .await
        .unwrap();

    let gateway = GatewayRouter::new(Arc::clone(&m.registry), GatewayConfig::default());
    gateway.attach_mesh(Arc::clone(&m.mesh));

    let get = |path: &str| {
        Request::builder()
            .uri(path)
            .body(Empty::<Bytes>::new())
            .unwrap()
    };

    let response = gateway.handle(get("/admin/services"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let services: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(services["count"], 1);
    assert_eq!(services["services"][0]["descriptor"]["name"], "catalog");
    assert_eq!(services["services"][0]["status"], "REGISTERED");
    assert_eq!(services["services"][0]["endpoints"][0]["id"], "catalog-1");

    let stats = gateway.stats();
    assert_eq!(stats.mesh.map(|m| m.total_services), Some(1));

    let response = gateway.handle(get("/health"), None).await;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let health: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["mesh"]["status"], "stopped");
}

#[tokio::test]
async fn test_health_transition_rewrites_proxy_config() {
    let m = mesh(without_loops());
    let ctx = RequestContext::new();
    m.mesh
        .register_service(
            &ctx,
            ServiceDescriptor::new("billing", "1.2.0")
                .with_id("billing-1")
                .with_http_port(8300),
        )
        .await
        .unwrap();
    m.mesh.check_service_health(&ctx, None).await.unwrap();

    let config_path = m.dir.path().join("billing.json");
    std::fs::remove_file(&config_path).unwrap();
    let mut rx = m.mesh.events().subscribe();

    m.backend.set_instance_health("billing-1", HealthState::Critical);
    let reports = m.mesh.check_service_health(&ctx, Some("billing")).await.unwrap();
    assert_eq!(reports["billing"].status, MeshServiceStatus::Unhealthy);

    let event = next_event(&mut rx, |e| {
        matches!(e, MeshEvent::ProxyConfigUpdated { .. })
    })
    .await;
    match event {
        MeshEvent::ProxyConfigUpdated {
            service_name, path, ..
        } => {
            assert_eq!(service_name, "billing");
            assert_eq!(path, config_path);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(config_path.exists());
}

#[tokio::test]
async fn test_deregistering_twice_leaves_state_untouched() {
    let m = mesh(without_loops());
    let ctx = RequestContext::new();
    m.mesh
        .register_service(
            &ctx,
            ServiceDescriptor::new("search", "0.9.0")
                .with_id("search-1")
                .with_http_port(8700),
        )
        .await
        .unwrap();

    assert!(m.mesh.deregister_service(&ctx, "search").await.unwrap());
    let first = m.mesh.get_service(&ctx, "search").await.unwrap().unwrap();
    let mut rx = m.mesh.events().subscribe();

    assert!(!m.mesh.deregister_service(&ctx, "search").await.unwrap());
    let second = m.mesh.get_service(&ctx, "search").await.unwrap().unwrap();
    assert_eq!(second.status, MeshServiceStatus::Deregistered);
    assert_eq!(second.deregistration_time, first.deregistration_time);
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(m.mesh.get_mesh_metrics().total_services, 0);
}
