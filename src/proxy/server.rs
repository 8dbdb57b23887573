use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::gate::RequestGate;
use crate::proxy::admin;
use crate::proxy::connection::ConnectionCounter;
use crate::proxy::error::{ErrorResponse, ProxyError};
use crate::proxy::shutdown::ShutdownManager;
use crate::proxy::upstream::UpstreamClient;
use crate::swap::{RequestView, SwapCoordinator};
use crate::tunnel::TunnelProxy;

const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{addr}': {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("try_bind() must be called before run()")]
    NotBound,

    #[error("Failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    gate: Arc<RequestGate>,
    upstream: Arc<UpstreamClient>,
}

/// Build the front-door router: admin routes under `admin_prefix` if set,
/// every other request goes through the gate.
pub fn build_router(
    gate: Arc<RequestGate>,
    upstream: Arc<UpstreamClient>,
    admin_prefix: Option<&str>,
) -> Router {
    let coordinator = gate.coordinator().clone();
    let app = Router::new()
        .fallback(proxy_handler)
        .with_state(AppState { gate, upstream });

    match admin_prefix {
        Some(prefix) => app.nest(prefix, admin::router(coordinator)),
        None => app,
    }
}

async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let (parts, body) = req.into_parts();

    let admission = match state.gate.admit(&RequestView::from(&parts)).await {
        Ok(admission) => admission,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Request rejected");
            return ErrorResponse::from_error(&ProxyError::from(e), &request_id);
        }
    };

    let generation = admission.generation().id();
    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        generation = %generation,
        held_ms = admission.held_for().map(|d| d.as_millis() as u64),
        "Request admitted"
    );

    let req = Request::from_parts(parts, body);
    match state.upstream.forward(req, admission).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                request_id = %request_id,
                generation = %generation,
                error = %e,
                "Forwarding failed"
            );
            ErrorResponse::from_error(&e, &request_id)
        }
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    addr.parse().map_err(|source| ServerError::InvalidAddr {
        addr: addr.to_string(),
        source,
    })
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    let addr = parse_addr(addr)?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Stable front door: the HTTP proxy plus the optional sideband tunnel.
pub struct ProxyServer {
    pub addr: SocketAddr,
    pub tunnel_addr: Option<SocketAddr>,
    bind_addr: String,
    tunnel_bind_addr: Option<String>,
    /// Bound listeners, populated by try_bind() and consumed by run().
    listener: Option<TcpListener>,
    tunnel_listener: Option<TcpListener>,
    router: Router,
    coordinator: Arc<SwapCoordinator>,
    tunnel: Arc<TunnelProxy>,
    shutdown: Arc<ShutdownManager>,
}

impl ProxyServer {
    pub fn new(
        config: &Config,
        gate: Arc<RequestGate>,
        tunnel: Arc<TunnelProxy>,
    ) -> Result<Self, ServerError> {
        let upstream = UpstreamClient::new(
            config.defaults.connect_timeout(),
            config.defaults.request_timeout(),
        )?;
        let coordinator = gate.coordinator().clone();
        let router = build_router(gate, Arc::new(upstream), config.proxy.admin_prefix.as_deref());
        let bind_addr = config.proxy.bind_addr.clone();

        Ok(Self {
            addr: parse_addr(&bind_addr)?,
            tunnel_addr: None,
            bind_addr,
            tunnel_bind_addr: config.proxy.tunnel_addr().map(str::to_string),
            listener: None,
            tunnel_listener: None,
            router,
            coordinator,
            tunnel,
            shutdown: Arc::new(ShutdownManager::new()),
        })
    }

    /// Bind the configured addresses. Clients expect the endpoint to stay
    /// put across swaps, so there is no fallback to another port.
    ///
    /// The listeners are kept alive until run() so nothing else can claim
    /// the ports in between.
    pub async fn try_bind(&mut self) -> Result<SocketAddr, ServerError> {
        let listener = bind(&self.bind_addr).await?;
        self.addr = listener.local_addr()?;
        self.listener = Some(listener);
        tracing::info!("Proxy bound to {}", self.addr);

        if let Some(tunnel_bind_addr) = &self.tunnel_bind_addr {
            let tunnel_listener = bind(tunnel_bind_addr).await?;
            let tunnel_addr = tunnel_listener.local_addr()?;
            self.tunnel_addr = Some(tunnel_addr);
            self.tunnel_listener = Some(tunnel_listener);
            tracing::info!("Tunnel bound to {}", tunnel_addr);
        }

        Ok(self.addr)
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownManager> {
        self.shutdown.clone()
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run until shutdown, then drain connections and retire every
    /// generation.
    ///
    /// Consumes self to take ownership of the pre-bound listeners.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = self.listener.ok_or(ServerError::NotBound)?;

        let tunnel_task = self.tunnel_listener.map(|tunnel_listener| {
            let tunnel = self.tunnel.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tunnel.serve(tunnel_listener, shutdown).await {
                    tracing::error!(error = %e, "Tunnel listener failed");
                }
            })
        });

        tracing::info!("Starting proxy server on {}", self.addr);

        let make_service = self.router.into_make_service();
        let make_service = ConnectionCounter::new(make_service, self.shutdown.clone());

        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, make_service)
            .with_graceful_shutdown(async move {
                if let Err(e) = shutdown.wait_for_shutdown().await {
                    tracing::error!(error = %e, "Failed to install signal handler");
                    shutdown.notified().await;
                }
            })
            .into_future()
            .await;

        // The tunnel watches the same flag; make sure it stops even if the
        // HTTP server exited on its own.
        self.shutdown.signal_shutdown();
        if let Some(task) = tunnel_task {
            let _ = task.await;
        }

        self.shutdown.wait_for_connections(CONNECTION_DRAIN_TIMEOUT).await;
        self.coordinator.shutdown().await;
        tracing::info!("Shutting down gracefully");

        served.map_err(ServerError::from)
    }
}

#[derive(Clone)]
pub struct ProxyHandle {
    shutdown: Arc<ShutdownManager>,
}

impl ProxyHandle {
    pub fn shutdown(&self) {
        self.shutdown.signal_shutdown();
    }
}
