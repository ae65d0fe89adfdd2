use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rust_meshplane::circuit_breaker::State;
use rust_meshplane::context::RequestContext;
use rust_meshplane::gateway::{
    GatewayBody, GatewayConfig, GatewayListener, GatewayRouter, ServiceRouteOptions,
    StaticRouteOptions,
};
use rust_meshplane::metrics::Metrics;
use rust_meshplane::registry::{
    HealthState, InMemoryRegistry, ServiceDescriptor, ServiceRegistryClient,
};
use rust_meshplane::router::{CircuitBreakerSpec, RateLimitSpec};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceExt;

/// Echoes the request line and forwarding headers as JSON.
async fn echo_handler(req: Request<Incoming>) -> Result<Response<String>, Infallible> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let body = serde_json::json!({
        "method": req.method().as_str(),
        "path": req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        "request_id": header("x-request-id"),
        "forwarded_for": header("x-forwarded-for"),
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(body.to_string())
        .unwrap())
}

async fn start_mock_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(echo_handler))
                    .await;
            });
        }
    });

    port
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn gateway() -> GatewayRouter {
    let registry = Arc::new(ServiceRegistryClient::new(Arc::new(InMemoryRegistry::new())));
    GatewayRouter::new(registry, GatewayConfig::default())
}

async fn register(gw: &GatewayRouter, service: &str, id: &str, port: u16) {
    gw.registry()
        .register(
            &RequestContext::new(),
            ServiceDescriptor::new(service, "1.0.0")
                .with_id(id)
                .with_http_port(port),
        )
        .await
        .unwrap();
}

async fn json_body<B>(response: Response<B>) -> serde_json::Value
where
    B: hyper::body::Body,
    B::Error: std::fmt::Debug,
{
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_forwards_to_discovered_instance() {
    let upstream_port = start_mock_upstream().await;
    let gw = gateway();
    register(&gw, "orders", "orders-1", upstream_port).await;
    gw.register_service_route(
        "/api/orders/*",
        "orders",
        ServiceRouteOptions::default().with_rewrite("/orders/"),
    )
    .unwrap();

    let listener = GatewayListener::bind("127.0.0.1:0", gw.clone())
        .await
        .unwrap();
    let gateway_addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let req = Request::builder()
        .uri(format!("http://{}/api/orders/42?expand=items", gateway_addr))
        .header("x-request-id", "e2e-orders-1")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = client.request(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "e2e-orders-1");
    let body = json_body(response).await;
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/orders/42?expand=items");
    assert_eq!(body["request_id"], "e2e-orders-1");
    assert_eq!(body["forwarded_for"], "127.0.0.1");

    let stats = gw.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.server_errors, 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_static_route() {
    let upstream_port = start_mock_upstream().await;
    let gw = gateway();
    gw.register_static_route(
        "/docs/*",
        &format!("http://127.0.0.1:{}/", upstream_port),
        StaticRouteOptions::default(),
    )
    .unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/docs/readme")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = gw.service(None).oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let generated_id = response.headers()["x-request-id"]
        .to_str()
        .unwrap()
        .to_string();
    let body = json_body(response).await;
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/docs/readme");
    assert_eq!(body["request_id"], generated_id.as_str());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_robin_spreads_across_instances() {
    let gw = gateway();
    for id in ["echo-1", "echo-2"] {
        let port = start_mock_upstream().await;
        register(&gw, "echo", id, port).await;
    }
    gw.register_service_route("/echo", "echo", ServiceRouteOptions::default())
        .unwrap();

    for _ in 0..4 {
        let req = Request::builder()
            .uri("/echo")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = gw.handle(req, None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let metrics = Metrics::encode().unwrap();
    assert!(metrics.contains("upstream=\"echo-1\""));
    assert!(metrics.contains("upstream=\"echo-2\""));
}

async fn call_flaky(gw: &GatewayRouter) -> Response<GatewayBody> {
    let req = Request::builder()
        .uri("/flaky")
        .header("x-request-id", "flaky-call")
        .body(Empty::<Bytes>::new())
        .unwrap();
    gw.handle(req, None).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_breaker_opens_after_repeated_upstream_failures() {
    let dead_port = closed_port().await;
    let gw = gateway();
    register(&gw, "flaky", "flaky-1", dead_port).await;
    gw.register_service_route(
        "/flaky",
        "flaky",
        ServiceRouteOptions::default()
            .with_timeout(Duration::from_secs(2))
            .with_circuit_breaker(CircuitBreakerSpec {
                failure_threshold: 2,
                reset_timeout_ms: 60_000,
                success_threshold: 1,
            }),
    )
    .unwrap();

    for _ in 0..2 {
        let response = call_flaky(&gw).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("upstream error"));
    }
    assert_eq!(gw.circuit_breaker_states()["flaky"].state, State::Open);

    let rejected = call_flaky(&gw).await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(rejected).await;
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(body["error"]["correlation_id"], "flaky-call");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("circuit breaker open"));

    let health_req = Request::builder()
        .uri("/health")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let health = json_body(gw.handle(health_req, None).await).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["circuit_breakers"]["flaky"]["state"], "OPEN");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhealthy_instances_are_not_selected() {
    let healthy_port = start_mock_upstream().await;
    let dead_port = closed_port().await;

    let backend = Arc::new(InMemoryRegistry::new());
    let registry = Arc::new(ServiceRegistryClient::new(backend.clone()));
    let gw = GatewayRouter::new(registry, GatewayConfig::default());
    register(&gw, "users", "users-good", healthy_port).await;
    register(&gw, "users", "users-bad", dead_port).await;
    backend.set_instance_health("users-bad", HealthState::Critical);
    gw.register_service_route("/users", "users", ServiceRouteOptions::default())
        .unwrap();

    for _ in 0..3 {
        let req = Request::builder()
            .uri("/users")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(gw.handle(req, None).await.status(), StatusCode::OK);
    }
    assert_eq!(gw.circuit_breaker_states()["users"].failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_window_through_gateway() {
    let upstream_port = start_mock_upstream().await;
    let gw = gateway();
    gw.register_static_route(
        "/quota/*",
        &format!("http://127.0.0.1:{}/", upstream_port),
        StaticRouteOptions::default()
            .with_rate_limit(RateLimitSpec::new(3, Duration::from_millis(1000))),
    )
    .unwrap();
    let client = "10.1.2.3:5000".parse().unwrap();
    let get = || {
        Request::builder()
            .uri("/quota/item")
            .body(Empty::<Bytes>::new())
            .unwrap()
    };

    for remaining in ["2", "1", "0"] {
        let response = gw.handle(get(), Some(client)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let denied = gw.handle(get(), Some(client)).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(denied.headers()["retry-after"], "1");
    assert_eq!(json_body(denied).await["error"]["code"], "RATE_LIMITED");
    assert_eq!(gw.stats().rate_limited, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let admitted = gw.handle(get(), Some(client)).await;
    assert_eq!(admitted.status(), StatusCode::OK);
    assert_eq!(admitted.headers()["x-ratelimit-remaining"], "2");
}
