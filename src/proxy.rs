//! Front door: routes the server proxy namespace to instances and everything
//! else to a fallback service.

use crate::config::PathMode;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::manager::InstanceManager;
use crate::paths::PathManager;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::port::connect_local;
use crate::registry::{ProxyOptions, ProxyTarget};
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Request ID header name
const X_REQUEST_ID: &str = "x-request-id";
/// X-Forwarded-For header name
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// X-Forwarded-Host header name
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// X-Forwarded-Proto header name
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on the header block of an upstream upgrade response
const MAX_UPGRADE_RESPONSE: usize = 16 * 1024;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Service answering requests outside the server proxy namespace,
/// including upgrade requests for paths no instance owns.
pub trait Fallback: Send + Sync {
    fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> BoxFuture<'static, Response<ProxyBody>>;
}

/// Fallback that answers every request with 404
pub struct NotFound;

impl Fallback for NotFound {
    fn handle(
        &self,
        req: Request<Incoming>,
        _client_addr: SocketAddr,
    ) -> BoxFuture<'static, Response<ProxyBody>> {
        let path = req.uri().path().to_string();
        Box::pin(async move {
            json_error_response(ProxyErrorCode::NotFound, format!("No route for {}", path))
        })
    }
}

struct Router {
    manager: Arc<InstanceManager>,
    pool: Arc<ConnectionPool>,
    fallback: Arc<dyn Fallback>,
    request_timeout: Duration,
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    manager: Arc<InstanceManager>,
    fallback: Arc<dyn Fallback>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<InstanceManager>,
        fallback: Arc<dyn Fallback>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            fallback,
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            request_timeout: Duration::from_secs(30),
            shutdown_rx,
        }
    }

    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = Arc::new(ConnectionPool::new(config));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            home = self.manager.paths().home_path(),
            kinds = self.manager.registry().len(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let router = Arc::new(Router {
            manager: self.manager,
            pool: self.pool,
            fallback: self.fallback,
            request_timeout: self.request_timeout,
        });
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
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
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr).await }
    });

    // HTTP/1.1 connections keep upgrade support for WebSockets
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let paths = router.manager.paths();

    let details = match paths.parse(req.uri().path()) {
        Some(details) => details,
        None => return Ok(pass_through(req, &router, client_addr).await),
    };
    let kind = details.kind_id.as_str();

    if !router.manager.registry().contains(kind) {
        debug!(kind, "Request for unknown kind");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownKind,
            format!("Unknown server proxy kind '{}'", kind),
        ));
    }

    // Never waits on the instance: a starting tool simply refuses connections
    let port = match router.manager.get(&details.instance_id) {
        Some(instance) if instance.kind() == kind && !instance.status().is_terminal() => {
            instance.port()
        }
        _ => {
            debug!(kind, instance_id = %details.instance_id, "Request for unavailable instance");
            return Ok(json_error_response(
                ProxyErrorCode::InstanceUnavailable,
                format!("Instance '{}' is not running", details.instance_id),
            ));
        }
    };

    let options = router
        .manager
        .proxy_options(kind)
        .cloned()
        .unwrap_or_default();
    let target = ProxyTarget {
        instance_id: details.instance_id.clone(),
        kind: kind.to_string(),
        port,
        base_path: details.base_path.clone(),
    };

    if let Some(hook) = &options.hook {
        if let Some(response) =
            hook.intercept(req.method(), req.uri().path(), req.headers(), &target)
        {
            return Ok(response);
        }
    }

    let request_id = request_id(req.headers());
    let original = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream = upstream_path(paths, options.path_mode, original);
    match upstream.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::BadRequest,
                "Invalid request path",
            ))
        }
    }

    set_forwarded_headers(req.headers_mut(), &request_id, client_addr);
    if options.change_origin {
        set_target_origin(req.headers_mut(), port);
    }
    if let Some(hook) = &options.hook {
        hook.on_proxy_request(req.headers_mut(), &target);
    }

    debug!(
        kind,
        instance_id = %target.instance_id,
        port,
        method = %req.method(),
        path = %upstream,
        request_id = %request_id,
        "Proxying request"
    );

    if is_upgrade_request(req.headers()) {
        return handle_upgrade(req, &router, &options, &target, request_id, paths).await;
    }

    *req.version_mut() = Version::HTTP_11;
    let result =
        tokio::time::timeout(router.request_timeout, router.pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => {
            let mut response = response.map(|body| body.boxed());
            let status = response.status();
            finish_response_headers(status, response.headers_mut(), &options, &target, paths);
            Ok(response)
        }
        Ok(Err(e)) => {
            warn!(instance_id = %target.instance_id, port, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to instance",
            ))
        }
        Err(_) => {
            warn!(
                instance_id = %target.instance_id,
                port,
                timeout_secs = router.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    router.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Hand a request outside the namespace to the fallback, removing the home
/// prefix when one is configured
async fn pass_through(
    mut req: Request<Incoming>,
    router: &Router,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let stripped = req
        .uri()
        .path_and_query()
        .and_then(|pq| router.manager.paths().strip_home(pq.as_str()));

    if let Some(path) = stripped {
        match path.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(_) => {
                return json_error_response(ProxyErrorCode::BadRequest, "Invalid request path")
            }
        }
    }

    router.fallback.handle(req, client_addr).await
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Path and query the instance receives
fn upstream_path(paths: &PathManager, mode: PathMode, original: &str) -> String {
    match mode {
        PathMode::Strip => paths.strip_prefix(original),
        PathMode::Preserve => paths
            .strip_home(original)
            .unwrap_or_else(|| original.to_string()),
    }
}

// The front door is the first trusted hop: client-supplied values are overwritten.
fn set_forwarded_headers(headers: &mut HeaderMap, request_id: &str, client_addr: SocketAddr) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

fn set_target_origin(headers: &mut HeaderMap, port: u16) {
    let host = format!("127.0.0.1:{}", port);
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(hyper::header::HOST, value);
    }
    if headers.contains_key(hyper::header::ORIGIN) {
        if let Ok(value) = HeaderValue::from_str(&format!("http://{}", host)) {
            headers.insert(hyper::header::ORIGIN, value);
        }
    }
}

fn finish_response_headers(
    status: StatusCode,
    headers: &mut HeaderMap,
    options: &ProxyOptions,
    target: &ProxyTarget,
    paths: &PathManager,
) {
    if options.rewrite_location {
        let base = location_base(paths, options.path_mode, target);
        let rewritten = headers
            .get(hyper::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| rewrite_location(location, target.port, &base));
        if let Some(location) = rewritten {
            if let Ok(value) = HeaderValue::from_str(&location) {
                headers.insert(hyper::header::LOCATION, value);
            }
        }
    }
    if let Some(hook) = &options.hook {
        hook.on_proxy_response(status, headers, target);
    }
}

/// Prefix that replaces `http://localhost:<port>` in redirects
fn location_base(paths: &PathManager, mode: PathMode, target: &ProxyTarget) -> String {
    match mode {
        PathMode::Strip => target.base_path.trim_end_matches('/').to_string(),
        // The tool already serves under the internal path
        PathMode::Preserve => paths.home_path().to_string(),
    }
}

/// Rewrite an absolute redirect to the instance's own address. Other
/// locations are left alone.
fn rewrite_location(location: &str, port: u16, base: &str) -> Option<String> {
    ["localhost", "127.0.0.1", "[::1]"].iter().find_map(|host| {
        let rest = location.strip_prefix(&format!("http://{}:{}", host, port))?;
        if rest.is_empty() {
            Some(format!("{}/", base))
        } else if rest.starts_with('/') || rest.starts_with('?') || rest.starts_with('#') {
            Some(format!("{}{}", base, rest))
        } else {
            None
        }
    })
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && headers.contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request sent to the instance
fn build_upgrade_request(method: &Method, path: &str, headers: &HeaderMap, port: u16) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);

    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if !headers.contains_key(hyper::header::HOST) {
        request.push_str(&format!("host: 127.0.0.1:{}\r\n", port));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Offset just past the blank line ending a header block
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the status line and headers of the instance's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read until the end of the response headers. Returns the buffer and the
/// offset where the upgraded byte stream begins.
async fn read_upgrade_response(stream: &mut TcpStream) -> io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "instance closed connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upgrade response headers too large",
            ));
        }
    }
}

async fn connect_upgrade(port: u16, raw_request: &[u8]) -> io::Result<(TcpStream, Vec<u8>, usize)> {
    let mut stream = connect_local(port).await?;
    stream.write_all(raw_request).await?;
    let (buf, end) = read_upgrade_response(&mut stream).await?;
    Ok((stream, buf, end))
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Forward an upgrade request to the instance and splice the two connections
async fn handle_upgrade(
    req: Request<Incoming>,
    router: &Router,
    options: &ProxyOptions,
    target: &ProxyTarget,
    request_id: String,
    paths: &PathManager,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let port = target.port;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let raw_request = build_upgrade_request(req.method(), path, req.headers(), port);

    let connected =
        tokio::time::timeout(router.request_timeout, connect_upgrade(port, &raw_request)).await;
    let (backend_stream, buf, header_end) = match connected {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            warn!(instance_id = %target.instance_id, port, error = %e, "Upgrade to instance failed");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to instance",
            ));
        }
        Err(_) => {
            warn!(instance_id = %target.instance_id, port, "Upgrade to instance timed out");
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Upgrade timed out after {} seconds",
                    router.request_timeout.as_secs()
                ),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&buf[..header_end]) {
        Some(parsed) => parsed,
        None => {
            error!(instance_id = %target.instance_id, "Invalid upgrade response from instance");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from instance",
            ));
        }
    };

    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (name_lower == "content-length" || name_lower == "transfer-encoding")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    finish_response_headers(status, response.headers_mut(), options, target, paths);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(instance_id = %target.instance_id, status = %status, "Instance rejected upgrade request");
        return Ok(response);
    }

    info!(instance_id = %target.instance_id, request_id = %request_id, "WebSocket upgrade successful");

    // Bytes the instance sent right after its headers belong to the client
    let leftover = buf[header_end..].to_vec();
    let instance_id = target.instance_id.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, leftover, &instance_id, &request_id)
                    .await;
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Forward bytes bidirectionally between client and instance connections
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    instance_id: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(instance_id, request_id, error = %e, "WebSocket client went away");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_instance, instance_to_client)) => {
            debug!(
                instance_id,
                request_id,
                client_to_instance,
                instance_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(instance_id, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}
