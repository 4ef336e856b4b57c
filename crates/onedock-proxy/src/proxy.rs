//! Per-port reverse proxy
//!
//! One [`PortProxy`] owns one listening socket on a public port and fronts
//! either a single backend or a load-balanced set. The mode is fixed at
//! construction; switching modes is done by replacing the proxy at the fleet
//! level.

use crate::error::{ProxyError, Result};
use crate::lb::{Backend, ConnectionGuard, LoadBalancer};
use bytes::Bytes;
use http::{header, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Budget for one upstream exchange
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a client may take to send request headers
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful stop deadline before the accept loop is aborted
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Body type for proxied responses
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Full body utility
pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

type ProxyClient = Client<HttpConnector, BoxBody>;

/// Routing mode of a [`PortProxy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Single,
    Balanced,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Single => "single",
            ProxyMode::Balanced => "balanced",
        }
    }
}

/// The target set behind one proxy: one backend or a balancer
#[derive(Debug)]
enum ProxyTargets {
    Single(Arc<Backend>),
    Balanced(LoadBalancer),
}

impl ProxyTargets {
    fn select(&self) -> Option<Arc<Backend>> {
        match self {
            ProxyTargets::Single(backend) => Some(Arc::clone(backend)),
            ProxyTargets::Balanced(lb) => lb.select(),
        }
    }

    fn mode(&self) -> ProxyMode {
        match self {
            ProxyTargets::Single(_) => ProxyMode::Single,
            ProxyTargets::Balanced(_) => ProxyMode::Balanced,
        }
    }
}

/// Per-backend counters reported by [`PortProxy::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub container_id: String,
    pub docker_port: u16,
    pub active: bool,
    pub connections: i64,
    pub weight: u32,
    pub last_used_ms: u64,
}

/// Snapshot of one proxy for the stats surface
#[derive(Debug, Clone, Serialize)]
pub struct PortProxyStats {
    pub public_port: u16,
    pub server_addr: String,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendStats>,
}

/// One listening socket on a public port
pub struct PortProxy {
    public_port: u16,
    targets: Arc<ProxyTargets>,
    client: ProxyClient,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PortProxy {
    /// Proxy every request to one backend
    pub fn single(public_port: u16, backend: Arc<Backend>) -> Self {
        Self::with_targets(public_port, ProxyTargets::Single(backend))
    }

    /// Proxy requests through a load balancer
    pub fn balanced(public_port: u16, balancer: LoadBalancer) -> Self {
        Self::with_targets(public_port, ProxyTargets::Balanced(balancer))
    }

    fn with_targets(public_port: u16, targets: ProxyTargets) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            public_port,
            targets: Arc::new(targets),
            client,
            shutdown_tx,
            shutdown_rx,
            accept_task: Mutex::new(None),
        }
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn mode(&self) -> ProxyMode {
        self.targets.mode()
    }

    /// Bind the public port and serve in a background task
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BindFailed`] when the port cannot be bound.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.public_port))
            .await
            .map_err(|e| ProxyError::BindFailed {
                port: self.public_port,
                reason: e.to_string(),
            })?;

        info!(
            port = self.public_port,
            mode = self.mode().as_str(),
            "proxy listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let targets = Arc::clone(&self.targets);
        let client = self.client.clone();
        let public_port = self.public_port;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(port = public_port, "proxy shutting down");
                            break;
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, remote_addr)) => {
                                let targets = Arc::clone(&targets);
                                let client = client.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(
                                        stream, targets, client, public_port,
                                    )
                                    .await
                                    {
                                        debug!(
                                            port = public_port,
                                            remote = %remote_addr,
                                            error = %e,
                                            "connection error"
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(port = public_port, error = %e, "failed to accept connection");
                            }
                        }
                    }
                }
            }
        });

        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop accepting connections: graceful within 5s, then forced
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!(port = self.public_port, "graceful stop timed out, aborting");
                abort.abort();
            }
        }

        info!(port = self.public_port, "proxy stopped");
    }

    /// Counters for the stats surface
    pub fn stats(&self) -> PortProxyStats {
        let (strategy, backend_count, backends) = match self.targets.as_ref() {
            ProxyTargets::Single(_) => (None, None, Vec::new()),
            ProxyTargets::Balanced(lb) => (
                Some(lb.strategy().as_str()),
                Some(lb.backend_count()),
                lb.backends().iter().map(|b| backend_stats(b)).collect(),
            ),
        };

        PortProxyStats {
            public_port: self.public_port,
            server_addr: format!(":{}", self.public_port),
            mode: self.mode().as_str(),
            strategy,
            backend_count,
            backends,
        }
    }
}

fn backend_stats(backend: &Backend) -> BackendStats {
    BackendStats {
        container_id: backend.mapping().container_id.clone(),
        docker_port: backend.mapping().docker_port,
        active: backend.is_active(),
        connections: backend.connection_count(),
        weight: backend.weight(),
        last_used_ms: backend.last_used_ms(),
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    targets: Arc<ProxyTargets>,
    client: ProxyClient,
    public_port: u16,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let targets = Arc::clone(&targets);
        let client = client.clone();
        async move {
            Ok::<_, hyper::Error>(handle_request(req, targets, client, public_port).await)
        }
    });

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::Hyper)?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    targets: Arc<ProxyTargets>,
    client: ProxyClient,
    public_port: u16,
) -> Response<BoxBody> {
    let Some(backend) = targets.select() else {
        error!(port = public_port, "no available backend");
        return service_unavailable();
    };

    let _guard = ConnectionGuard::new(Arc::clone(&backend));
    backend.touch();

    debug!(
        port = public_port,
        method = %req.method(),
        path = %req.uri().path(),
        backend = backend.mapping().docker_port,
        "forwarding request"
    );

    match forward(req, &backend, &client).await {
        Ok(response) => response,
        Err(e) => {
            error!(
                port = public_port,
                backend = %backend.mapping().container_id,
                error = %e,
                "upstream request failed"
            );
            bad_gateway(&backend)
        }
    }
}

async fn forward(
    req: Request<Incoming>,
    backend: &Backend,
    client: &ProxyClient,
) -> Result<Response<BoxBody>> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = format!("http://{}{}", backend.target_authority(), path_and_query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::Internal(format!("invalid upstream uri: {}", e)))?;

    let body = body.collect().await.map_err(ProxyError::Hyper)?.to_bytes();
    let outbound = Request::from_parts(parts, full_body(body));

    let upstream = |reason: String| ProxyError::UpstreamFailed {
        backend: backend.mapping().container_id.clone(),
        reason,
    };

    let response = tokio::time::timeout(UPSTREAM_TIMEOUT, client.request(outbound))
        .await
        .map_err(|_| upstream(format!("timeout after {:?}", UPSTREAM_TIMEOUT)))?
        .map_err(|e| upstream(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| upstream(e.to_string()))?
        .to_bytes();

    Ok(Response::from_parts(parts, full_body(body)))
}

/// 503 answered when selection yields no backend
fn service_unavailable() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(r#"{"error":"no available backends"}"#))
        .expect("static response")
}

/// 502 naming the backend that did not answer
fn bad_gateway(backend: &Backend) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(full_body(format!(
            "backend {} is unavailable",
            backend.mapping().container_id
        )))
        .expect("static response")
}
