//! TCP listener serving the gateway over HTTP/1.1 or h2c.

use super::{GatewayRouter, GatewayService};
use crate::error::{MeshError, Result};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// Wire protocol spoken on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayProtocol {
    Http1,
    /// HTTP/2 with prior knowledge, no TLS.
    H2c,
}

/// Accepts connections and hands each one to the gateway on its own task.
///
/// # Example
///
/// ```no_run
/// use rust_meshplane::gateway::{GatewayConfig, GatewayListener, GatewayRouter};
/// use rust_meshplane::registry::{InMemoryRegistry, ServiceRegistryClient};
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = Arc::new(ServiceRegistryClient::new(Arc::new(InMemoryRegistry::new())));
///     let gateway = GatewayRouter::new(registry, GatewayConfig::default());
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let listener = GatewayListener::bind("127.0.0.1:8080", gateway).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct GatewayListener {
    tcp_listener: TcpListener,
    gateway: GatewayRouter,
    addr: SocketAddr,
    protocol: GatewayProtocol,
}

impl GatewayListener {
    /// Binds an HTTP/1.1 listener.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(gateway))]
    pub async fn bind(addr: &str, gateway: GatewayRouter) -> Result<Self> {
        Self::bind_with(addr, gateway, GatewayProtocol::Http1).await
    }

    /// Binds an h2c listener.
    #[instrument(level = "info", skip(gateway))]
    pub async fn bind_h2c(addr: &str, gateway: GatewayRouter) -> Result<Self> {
        Self::bind_with(addr, gateway, GatewayProtocol::H2c).await
    }

    async fn bind_with(
        addr: &str,
        gateway: GatewayRouter,
        protocol: GatewayProtocol,
    ) -> Result<Self> {
        let bind_error = |e| MeshError::ListenerBind {
            addr: addr.to_string(),
            source: e,
        };
        let tcp_listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = tcp_listener.local_addr().map_err(bind_error)?;

        info!(addr = %local_addr, protocol = ?protocol, "gateway bound");
        Ok(Self {
            tcp_listener,
            gateway,
            addr: local_addr,
            protocol,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocol(&self) -> GatewayProtocol {
        self.protocol
    }

    /// Serves connections until `shutdown_rx` fires. Connections already
    /// accepted run to completion on their own tasks.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "accepted connection");
                            let service = self.gateway.service(Some(peer_addr));
                            let protocol = self.protocol;
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, service, protocol).await {
                                    error!(peer = %peer_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: GatewayService,
    protocol: GatewayProtocol,
) -> Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let mut svc = service.clone();
        async move { svc.call(req).await }
    });

    match protocol {
        GatewayProtocol::Http1 => http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(MeshError::Http),
        GatewayProtocol::H2c => http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(MeshError::Http),
    }
}
