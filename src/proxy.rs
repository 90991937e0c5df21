use crate::config::ProxyTarget;
use crate::error::{json_error_response, Error, ProxyErrorCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, DATE, HOST, SERVER, TRANSFER_ENCODING};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Response headers regenerated by the transport layer instead of relayed
const FILTERED_RESPONSE_HEADERS: [HeaderName; 3] = [SERVER, DATE, TRANSFER_ENCODING];

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive accept failures after which the listener is considered broken
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 50;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Why a single forward failed
#[derive(Debug, thiserror::Error)]
enum ForwardError {
    /// Connection to the backend failed, was reset, or timed out
    #[error("{0}")]
    Unreachable(String),
    /// Bad inbound data or a request that cannot be rebuilt
    #[error("{0}")]
    Internal(String),
}

/// Counts requests currently being proxied
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(&self.0))
    }

    /// Wait until no requests are in flight, or `timeout` passes.
    ///
    /// Returns true when fully drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drain_start = Instant::now();
        while self.count() > 0 {
            if drain_start.elapsed() > timeout {
                warn!(
                    remaining = self.count(),
                    "Drain timeout exceeded, proceeding with shutdown"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(drained_in_ms = drained_in.as_millis() as u64, "Drained in-flight requests");
        }
        true
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The public-facing forwarding proxy
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    target: Arc<ProxyTarget>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
    in_flight: InFlight,
}

impl ProxyServer {
    /// Bind the public listener.
    ///
    /// Binding is separate from [`run`](ProxyServer::run) so startup can fail
    /// before the coordinator reports the proxy as serving.
    pub async fn bind(
        bind_addr: SocketAddr,
        target: Arc<ProxyTarget>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        let port = bind_addr.port();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => Error::PortUnavailable { port },
            ErrorKind::PermissionDenied => Error::PermissionDenied { port },
            _ => Error::Io(e),
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            target,
            request_timeout,
            shutdown_rx,
            in_flight: InFlight::default(),
        })
    }

    /// Address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for observing and draining in-flight requests
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> Result<(), Error> {
        info!(addr = %self.local_addr, backend = %self.target, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut accept_errors = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                info!("Proxy server shutting down");
                break;
            }

            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            accept_errors = 0;
                            let target = Arc::clone(&self.target);
                            let in_flight = self.in_flight.clone();
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, target, request_timeout, in_flight).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            accept_errors += 1;
                            error!(error = %e, consecutive = accept_errors, "Failed to accept connection");
                            if accept_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                                return Err(Error::Io(e));
                            }
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    target: Arc<ProxyTarget>,
    request_timeout: Duration,
    in_flight: InFlight,
) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let target = Arc::clone(&target);
        let in_flight = in_flight.clone();
        async move { handle_request(req, target, request_timeout, in_flight, addr).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
}

async fn handle_request(
    req: Request<Incoming>,
    target: Arc<ProxyTarget>,
    request_timeout: Duration,
    in_flight: InFlight,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let _guard = in_flight.enter();
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let response = match forward(req, &target, request_timeout).await {
        Ok(response) => response,
        Err(ForwardError::Unreachable(message)) => {
            warn!(method = %method, path = %path, backend = %target, error = %message, "Backend unreachable");
            json_error_response(
                ProxyErrorCode::BackendUnreachable,
                format!("Bad Gateway: {}", message),
            )
        }
        Err(ForwardError::Internal(message)) => {
            error!(method = %method, path = %path, error = %message, "Failed to forward request");
            json_error_response(
                ProxyErrorCode::InternalError,
                format!("Internal Server Error: {}", message),
            )
        }
    };

    log_exchange(&method, &path, response.status(), started.elapsed(), client_addr);
    Ok(response)
}

/// Replay one request against the backend over a fresh connection
async fn forward(
    req: Request<Incoming>,
    target: &ProxyTarget,
    request_timeout: Duration,
) -> Result<Response<ProxyBody>, ForwardError> {
    let (parts, body) = req.into_parts();

    // hyper frames the body by Content-Length, so this is exactly the declared bytes
    let body = body
        .collect()
        .await
        .map_err(|e| ForwardError::Internal(format!("failed to read request body: {}", e)))?
        .to_bytes();

    let outbound = build_outbound_request(&parts, body, target)?;

    let exchange = async {
        let stream = TcpStream::connect(target.authority()).await.map_err(|e| {
            ForwardError::Unreachable(format!("failed to connect to {}: {}", target, e))
        })?;
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ForwardError::Unreachable(format!("handshake with {} failed: {}", target, e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Backend connection closed with error");
            }
        });

        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| ForwardError::Unreachable(format!("request to {} failed: {}", target, e)))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| {
                ForwardError::Unreachable(format!("failed to read response from {}: {}", target, e))
            })?
            .to_bytes();

        Ok::<_, ForwardError>((parts, body))
    };

    let (parts, body) = tokio::time::timeout(request_timeout, exchange)
        .await
        .map_err(|_| {
            ForwardError::Unreachable(format!(
                "{} did not respond within {} seconds",
                target,
                request_timeout.as_secs()
            ))
        })??;

    Ok(build_client_response(parts, body))
}

/// Copy method, origin-form path and all headers onto a new request
fn build_outbound_request(
    parts: &http::request::Parts,
    body: Bytes,
    target: &ProxyTarget,
) -> Result<Request<Full<Bytes>>, ForwardError> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(path)
        .version(Version::HTTP_11);

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&target.authority())
                .map_err(|e| ForwardError::Internal(format!("invalid backend host: {}", e)))?;
            headers.insert(HOST, host);
        }
    }

    builder
        .body(Full::new(body))
        .map_err(|e| ForwardError::Internal(format!("failed to build backend request: {}", e)))
}

/// Backend status, headers minus the filtered set, and the body verbatim
fn build_client_response(parts: http::response::Parts, body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
    *response.status_mut() = parts.status;

    let headers = response.headers_mut();
    for (name, value) in parts.headers.iter() {
        if FILTERED_RESPONSE_HEADERS.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    response
}

/// Successful exchanges are debug noise; client and server errors are worth seeing
fn log_exchange(
    method: &Method,
    path: &str,
    status: StatusCode,
    elapsed: Duration,
    client_addr: SocketAddr,
) {
    let elapsed_ms = elapsed.as_millis() as u64;
    if status.as_u16() >= 400 {
        info!(client = %client_addr, method = %method, path, status = status.as_u16(), elapsed_ms, "Request");
    } else {
        debug!(client = %client_addr, method = %method, path, status = status.as_u16(), elapsed_ms, "Request");
    }
}
