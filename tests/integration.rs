//! End-to-end tests for the supervisor, the front door and status sync

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use toolgate::api::ControlApi;
use toolgate::client::StatusFollower;
use toolgate::config::{Config, LifecycleTimings, PathMode, ValidationMode};
use toolgate::error::{json_error_response, ProxyErrorCode};
use toolgate::manager::InstanceManager;
use toolgate::paths::PathManager;
use toolgate::port::{LocalPortAllocator, PortAllocator};
use toolgate::proxy::{Fallback, NotFound, ProxyServer};
use toolgate::registry::{
    CommandContext, HookResponse, LaunchCommand, LaunchContext, ProxyHook, ProxyOptions,
    ProxyTarget, Registry, ServerProxyKind,
};
use toolgate::status::{InstanceStatus, StatusId};
use toolgate::sync::{StatusHub, INSTANCE_GONE_MESSAGE};

// ============================================================================
// Helpers
// ============================================================================

/// WebSocket magic GUID for computing accept key
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Fixed client key from RFC 6455
const WS_CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// Frame the mock upstream sends right after accepting an upgrade
const WS_GREETING: &[u8] = &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'];

fn compute_accept_key(key: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hash)
}

fn test_timings() -> LifecycleTimings {
    LifecycleTimings {
        health_check_interval: Duration::from_millis(50),
        startup_timeout: Duration::from_millis(600),
        stop_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(200),
        validation: ValidationMode::Status,
    }
}

fn unused_port() -> u16 {
    LocalPortAllocator.allocate().unwrap()
}

/// Stands in for a tool: runs `sleep` and reports a port served in-process
struct UpstreamKind {
    id: &'static str,
    port: u16,
    path_mode: PathMode,
    hook: Option<Arc<dyn ProxyHook>>,
}

impl UpstreamKind {
    fn new(id: &'static str, port: u16) -> Self {
        Self {
            id,
            port,
            path_mode: PathMode::Strip,
            hook: None,
        }
    }
}

impl ServerProxyKind for UpstreamKind {
    fn id(&self) -> &str {
        self.id
    }

    fn build_command(&self, _ctx: &CommandContext<'_>) -> anyhow::Result<LaunchCommand> {
        Ok(LaunchCommand::new(
            vec!["sleep".to_string(), "30".to_string()],
            self.port,
        ))
    }

    fn build_middleware(&self, _base_path: &str, mut options: ProxyOptions) -> ProxyOptions {
        options.path_mode = self.path_mode;
        options.hook = self.hook.clone();
        options
    }
}

/// Answers `/hooked` itself and tags every proxied response
struct TagHook;

impl ProxyHook for TagHook {
    fn intercept(
        &self,
        _method: &Method,
        path: &str,
        _headers: &HeaderMap,
        _target: &ProxyTarget,
    ) -> Option<HookResponse> {
        if path.ends_with("/hooked") {
            Some(json_error_response(ProxyErrorCode::BadRequest, "answered by hook"))
        } else {
            None
        }
    }

    fn on_proxy_response(&self, _status: StatusCode, headers: &mut HeaderMap, target: &ProxyTarget) {
        if let Ok(value) = target.instance_id.parse() {
            headers.insert("x-served-by", value);
        }
    }
}

async fn read_head(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            return Some((head, buf[pos + 4..].to_vec()));
        }
    }
}

/// In-process tool: echoes request details, redirects, stalls and speaks
/// just enough WebSocket to echo frames back
async fn mock_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_mock(stream, port));
        }
    });
    port
}

async fn serve_mock(mut stream: TcpStream, port: u16) {
    let Some((head, _)) = read_head(&mut stream).await else {
        return;
    };
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    let ws_key = header("sec-websocket-key");
    if !ws_key.is_empty() {
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\nX-Upstream-Path: {}\r\n\r\n",
            compute_accept_key(&ws_key),
            path
        )
        .into_bytes();
        response.extend_from_slice(WS_GREETING);
        if stream.write_all(&response).await.is_err() {
            return;
        }
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    let response = if path.ends_with("/slow") {
        tokio::time::sleep(Duration::from_secs(10)).await;
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    } else if path.ends_with("/redirect") {
        format!(
            "HTTP/1.1 302 Found\r\nLocation: http://localhost:{}/login?next=1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            port
        )
    } else {
        let body = format!(
            "path={}\nhost={}\nforwarded-for={}\nforwarded-host={}\nrequest-id={}\n",
            path,
            header("host"),
            header("x-forwarded-for"),
            header("x-forwarded-host"),
            header("x-request-id"),
        );
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    };
    let _ = stream.write_all(response.as_bytes()).await;
}

fn build_manager(home: &str, kinds: Vec<Arc<dyn ServerProxyKind>>) -> Arc<InstanceManager> {
    build_manager_with(home, kinds, test_timings())
}

fn build_manager_with(
    home: &str,
    kinds: Vec<Arc<dyn ServerProxyKind>>,
    timings: LifecycleTimings,
) -> Arc<InstanceManager> {
    let mut builder = Registry::builder();
    for kind in kinds {
        builder = builder.register_arc(kind).unwrap();
    }
    InstanceManager::new(
        builder.build(),
        PathManager::new(home),
        timings,
        Arc::new(StatusHub::new()),
    )
}

/// Start the front door on an ephemeral port
async fn start_proxy(
    manager: Arc<InstanceManager>,
    fallback: Arc<dyn Fallback>,
    request_timeout: Duration,
) -> (u16, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(addr, manager, fallback, shutdown_rx)
        .with_request_timeout(request_timeout);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr.port(), shutdown_tx)
}

async fn start_with_api(manager: &Arc<InstanceManager>) -> (u16, watch::Sender<bool>) {
    let api = Arc::new(ControlApi::new(Arc::clone(manager)));
    start_proxy(Arc::clone(manager), api, Duration::from_secs(5)).await
}

/// Send a request and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response)).await??;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> String {
    http_request(port, "GET", path, &[], "").await.unwrap()
}

fn status_code(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn response_body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

async fn wait_for_status(
    instance: &toolgate::instance::Instance,
    status: StatusId,
) -> InstanceStatus {
    let mut rx = instance.watch_status();
    let reached = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.status_id == status),
    )
    .await
    .expect("status not reached in time")
    .expect("status channel closed")
    .clone();
    reached
}

// ============================================================================
// Lifecycle scenarios
// ============================================================================

#[tokio::test]
async fn test_start_reaches_started_and_proxies() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    assert_eq!(instance.status().status_id, StatusId::Starting);
    let mut events = instance.subscribe();

    wait_for_status(&instance, StatusId::Started).await;

    let mut seen = Vec::new();
    while let Ok(status) = events.try_recv() {
        seen.push(status.status_id);
    }
    assert_eq!(
        seen,
        vec![StatusId::Starting, StatusId::WaitingForPort, StatusId::Started]
    );

    let path = format!("/server-proxy/echo/{}/", instance.id());
    let response = http_get(port, &path).await;
    assert_eq!(status_code(&response), 200, "response: {}", response);

    let body = response_body(&response);
    assert!(body.contains("path=/\n"), "body: {}", body);
    assert!(body.contains(&format!("host=127.0.0.1:{}\n", upstream)), "body: {}", body);
    assert!(body.contains("forwarded-for=127.0.0.1\n"), "body: {}", body);
    assert!(body.contains(&format!("forwarded-host=127.0.0.1:{}\n", port)), "body: {}", body);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_slow_kind_errors_after_startup_timeout() {
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("slow", unused_port()))]);
    let (_client, mut hub_rx) = manager.hub().connect_channel(64);

    let instance = manager.start("slow", LaunchContext::empty()).unwrap();
    let id = instance.id().to_string();

    let errored = wait_for_status(&instance, StatusId::Errored).await;
    let message = errored.status_message.unwrap_or_default();
    assert!(message.contains("timed out"), "message: {}", message);

    // The hub saw the whole story, ending in the timeout
    let mut last = None;
    while let Ok(Some(status)) = tokio::time::timeout(Duration::from_secs(2), hub_rx.recv()).await {
        let terminal = status.is_terminal();
        last = Some(status);
        if terminal {
            break;
        }
    }
    assert_eq!(last.map(|s| s.status_id), Some(StatusId::Errored));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.get(&id).is_none());
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_get_or_create_deduplicates_by_context() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .get_or_create("echo", LaunchContext::from(json!({"user": "a"})))
                    .unwrap()
                    .id()
                    .to_string()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "ids: {:?}", ids);

    let other = manager
        .get_or_create("echo", LaunchContext::from(json!({"user": "b"})))
        .unwrap();
    assert_ne!(other.id(), ids[0]);
    assert_eq!(manager.get_by_kind("echo").len(), 2);

    manager.shutdown().await;
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_stopped_instance_is_unavailable() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::Started).await;
    let path = format!("/server-proxy/echo/{}/page", instance.id());
    assert_eq!(status_code(&http_get(port, &path).await), 200);

    assert!(manager.stop(instance.id()).await);
    assert!(instance.stop().await, "stop is idempotent");
    assert!(instance.status().is_terminal());
    assert!(!manager.stop(instance.id()).await, "unknown ids report false");

    let details = manager.paths().parse(&path).unwrap();
    assert_eq!(details.instance_id, instance.id());

    let response = http_get(port, &path).await;
    assert_eq!(status_code(&response), 503, "response: {}", response);
    assert_eq!(header_value(&response, "x-proxy-error"), Some("INSTANCE_UNAVAILABLE"));
}

#[tokio::test]
async fn test_process_exit_marks_stopped_and_cleans_up() {
    struct ShortLived;

    impl ServerProxyKind for ShortLived {
        fn id(&self) -> &str {
            "short"
        }

        fn build_command(&self, ctx: &CommandContext<'_>) -> anyhow::Result<LaunchCommand> {
            Ok(LaunchCommand::new(
                vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
                ctx.port,
            ))
        }
    }

    let manager = build_manager("", vec![Arc::new(ShortLived)]);
    let first = manager
        .get_or_create("short", LaunchContext::empty())
        .unwrap();
    wait_for_status(&first, StatusId::Stopped).await;
    assert!(first.stop().await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.get(first.id()).is_none());

    let second = manager
        .get_or_create("short", LaunchContext::empty())
        .unwrap();
    assert_ne!(first.id(), second.id());
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_unknown_kind_and_instance_errors() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let response = http_get(port, "/server-proxy/nope/1/").await;
    assert_eq!(status_code(&response), 404);
    assert_eq!(header_value(&response, "x-proxy-error"), Some("UNKNOWN_KIND"));

    let response = http_get(port, "/server-proxy/echo/42/").await;
    assert_eq!(status_code(&response), 503);
    let body: Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(body["code"], "INSTANCE_UNAVAILABLE");
    assert_eq!(body["status"], 503);

    // Too short for the namespace: handled by the fallback
    let response = http_get(port, "/server-proxy/echo").await;
    assert_eq!(status_code(&response), 404);
    assert_eq!(header_value(&response, "x-proxy-error"), Some("NOT_FOUND"));
}

#[tokio::test]
async fn test_home_prefix_and_fallback_pass_through() {
    let upstream = mock_upstream().await;
    let manager = build_manager("ide/", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_with_api(&manager).await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::Started).await;
    assert_eq!(
        instance.public_path(),
        format!("/ide/server-proxy/echo/{}/", instance.id())
    );

    let response = http_get(port, &format!("/ide/server-proxy/echo/{}/a/b?c=d", instance.id())).await;
    assert_eq!(status_code(&response), 200);
    assert!(response_body(&response).contains("path=/a/b?c=d\n"));

    // Without the home prefix the path is not in the namespace
    let response = http_get(port, &format!("/server-proxy/echo/{}/", instance.id())).await;
    assert_eq!(status_code(&response), 404);

    let response = http_get(port, "/ide/health").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(response_body(&response), "ok");

    let response = http_get(port, "/ide/api/kinds").await;
    let kinds: Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(kinds, json!([{"id": "echo", "name": "echo"}]));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_preserve_mode_forwards_internal_path() {
    let upstream = mock_upstream().await;
    let mut kind = UpstreamKind::new("notebook", upstream);
    kind.path_mode = PathMode::Preserve;
    let manager = build_manager("/ide", vec![Arc::new(kind)]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("notebook", LaunchContext::empty()).unwrap();
    assert_eq!(
        instance.health_path(),
        format!("/server-proxy/notebook/{}/", instance.id())
    );
    wait_for_status(&instance, StatusId::Started).await;

    let response = http_get(
        port,
        &format!("/ide/server-proxy/notebook/{}/tree?x=1", instance.id()),
    )
    .await;
    assert_eq!(status_code(&response), 200);
    assert!(
        response_body(&response).contains(&format!(
            "path=/server-proxy/notebook/{}/tree?x=1\n",
            instance.id()
        )),
        "response: {}",
        response
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_location_header_rewritten_to_public_path() {
    let upstream = mock_upstream().await;
    let manager = build_manager("/ide", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::Started).await;

    let response = http_get(port, &format!("/ide/server-proxy/echo/{}/redirect", instance.id())).await;
    assert_eq!(status_code(&response), 302);
    assert_eq!(
        header_value(&response, "location"),
        Some(format!("/ide/server-proxy/echo/{}/login?next=1", instance.id()).as_str())
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_request_id_propagated_and_hooks_applied() {
    let upstream = mock_upstream().await;
    let mut kind = UpstreamKind::new("echo", upstream);
    kind.hook = Some(Arc::new(TagHook));
    let manager = build_manager("", vec![Arc::new(kind)]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::Started).await;

    let response = http_request(
        port,
        "GET",
        &format!("/server-proxy/echo/{}/", instance.id()),
        &[("X-Request-ID", "trace-123"), ("X-Forwarded-For", "6.6.6.6")],
        "",
    )
    .await
    .unwrap();
    assert_eq!(status_code(&response), 200);
    let body = response_body(&response);
    assert!(body.contains("request-id=trace-123\n"), "body: {}", body);
    assert!(body.contains("forwarded-for=127.0.0.1\n"), "body: {}", body);
    assert_eq!(header_value(&response, "x-served-by"), Some(instance.id()));

    let response = http_get(port, &format!("/server-proxy/echo/{}/hooked", instance.id())).await;
    assert_eq!(status_code(&response), 400);
    assert!(response_body(&response).contains("answered by hook"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_returns_504() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_proxy(
        Arc::clone(&manager),
        Arc::new(NotFound),
        Duration::from_millis(300),
    )
    .await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::Started).await;

    let response = http_get(port, &format!("/server-proxy/echo/{}/slow", instance.id())).await;
    assert_eq!(status_code(&response), 504);
    assert_eq!(header_value(&response, "x-proxy-error"), Some("REQUEST_TIMEOUT"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_waiting_instance_refuses_with_502() {
    let timings = LifecycleTimings {
        startup_timeout: Duration::from_secs(30),
        ..test_timings()
    };
    let manager = build_manager_with(
        "",
        vec![Arc::new(UpstreamKind::new("slow", unused_port()))],
        timings,
    );
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("slow", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::WaitingForPort).await;

    let response = http_get(port, &format!("/server-proxy/slow/{}/", instance.id())).await;
    assert_eq!(status_code(&response), 502);
    assert_eq!(header_value(&response, "x-proxy-error"), Some("CONNECTION_FAILED"));

    manager.shutdown().await;
}

// ============================================================================
// WebSocket
// ============================================================================

/// Perform a WebSocket handshake, returning the stream and any bytes read
/// past the response headers
async fn websocket_handshake(
    port: u16,
    path: &str,
) -> Result<(TcpStream, String, Vec<u8>), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: 127.0.0.1:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path, port, WS_CLIENT_KEY
    );
    stream.write_all(request.as_bytes()).await?;

    let (head, rest) = read_head(&mut stream)
        .await
        .ok_or("connection closed during handshake")?;
    if !head.starts_with("HTTP/1.1 101") {
        return Err(format!("WebSocket handshake failed: {}", head).into());
    }
    Ok((stream, head, rest))
}

async fn read_exactly(stream: &mut TcpStream, buffered: &mut Vec<u8>, len: usize) -> Vec<u8> {
    let mut chunk = [0u8; 1024];
    while buffered.len() < len {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out reading frame")
            .expect("read failed");
        assert!(n > 0, "connection closed early");
        buffered.extend_from_slice(&chunk[..n]);
    }
    buffered.drain(..len).collect()
}

#[tokio::test]
async fn test_websocket_upgrade_through_proxy() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_proxy(Arc::clone(&manager), Arc::new(NotFound), Duration::from_secs(5)).await;

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&instance, StatusId::Started).await;

    let (mut stream, head, mut buffered) =
        websocket_handshake(port, &format!("/server-proxy/echo/{}/ws?room=1", instance.id()))
            .await
            .unwrap();

    let expected_accept = compute_accept_key(WS_CLIENT_KEY);
    assert!(head.contains(&expected_accept), "head: {}", head);
    assert!(head.to_lowercase().contains("x-upstream-path: /ws?room=1"), "head: {}", head);

    // Sent by the tool in the same packet as its 101
    let greeting = read_exactly(&mut stream, &mut buffered, WS_GREETING.len()).await;
    assert_eq!(greeting, WS_GREETING);

    // Masked client text frame "ping"
    let mask = [1u8, 2, 3, 4];
    let mut frame = vec![0x81, 0x80 | 4];
    frame.extend_from_slice(&mask);
    frame.extend(b"ping".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).await.unwrap();

    let echoed = read_exactly(&mut stream, &mut buffered, frame.len()).await;
    assert_eq!(echoed, frame);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_outside_namespace_reaches_fallback() {
    struct UpgradeAware;

    impl Fallback for UpgradeAware {
        fn handle(
            &self,
            req: hyper::Request<hyper::body::Incoming>,
            _client_addr: SocketAddr,
        ) -> futures::future::BoxFuture<'static, hyper::Response<toolgate::proxy::ProxyBody>> {
            let upgrade = req.headers().contains_key(hyper::header::UPGRADE);
            let path = req.uri().path().to_string();
            Box::pin(async move {
                json_error_response(
                    ProxyErrorCode::BadRequest,
                    format!("fallback saw {} upgrade={}", path, upgrade),
                )
            })
        }
    }

    let manager = build_manager("", vec![]);
    let (port, _shutdown) = start_proxy(manager, Arc::new(UpgradeAware), Duration::from_secs(5)).await;

    let err = websocket_handshake(port, "/socket").await.unwrap_err();
    assert!(err.to_string().contains("400"), "error: {}", err);

    let response = http_request(
        port,
        "GET",
        "/socket",
        &[("Upgrade", "websocket"), ("Connection", "Upgrade")],
        "",
    )
    .await
    .unwrap();
    assert!(response_body(&response).contains("fallback saw /socket upgrade=true"));
}

// ============================================================================
// Control API and status sync
// ============================================================================

#[tokio::test]
async fn test_api_instance_lifecycle() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_with_api(&manager).await;

    let body = r#"{"kind":"echo","context":{"user":"a"}}"#;
    let first = http_request(port, "POST", "/api/instances", &[("Content-Type", "application/json")], body)
        .await
        .unwrap();
    assert_eq!(status_code(&first), 200, "response: {}", first);
    let first: Value = serde_json::from_str(response_body(&first)).unwrap();

    let second = http_request(port, "POST", "/api/instances", &[], body).await.unwrap();
    let second: Value = serde_json::from_str(response_body(&second)).unwrap();
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["kind"], "echo");
    assert_eq!(first["context"], json!({"user": "a"}));
    assert_eq!(first["port"], upstream);

    let fresh = http_request(
        port,
        "POST",
        "/api/instances",
        &[],
        r#"{"kind":"echo","context":{"user":"a"},"reuse":false}"#,
    )
    .await
    .unwrap();
    let fresh: Value = serde_json::from_str(response_body(&fresh)).unwrap();
    assert_ne!(fresh["id"], first["id"]);

    let id = first["id"].as_str().unwrap().to_string();
    let listed: Value =
        serde_json::from_str(response_body(&http_get(port, "/api/instances?kind=echo").await)).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 2);
    assert_eq!(listed[0]["id"], json!(id));

    let single: Value =
        serde_json::from_str(response_body(&http_get(port, &format!("/api/instances/{}", id)).await)).unwrap();
    assert_eq!(single["status"]["instanceId"], json!(id));

    let stopped = http_request(port, "DELETE", &format!("/api/instances/{}", id), &[], "")
        .await
        .unwrap();
    let stopped: Value = serde_json::from_str(response_body(&stopped)).unwrap();
    assert_eq!(stopped, json!({"stopped": true}));

    let missing = http_get(port, &format!("/api/instances/{}", id)).await;
    assert_eq!(status_code(&missing), 404);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_api_rejects_bad_requests() {
    let manager = build_manager("", vec![]);
    let (port, _shutdown) = start_with_api(&manager).await;

    let response = http_request(port, "POST", "/api/instances", &[], r#"{"kind":"nope"}"#)
        .await
        .unwrap();
    assert_eq!(status_code(&response), 404);
    assert_eq!(header_value(&response, "x-proxy-error"), Some("UNKNOWN_KIND"));

    let response = http_request(port, "POST", "/api/instances", &[], "not json")
        .await
        .unwrap();
    assert_eq!(status_code(&response), 400);

    let version: Value = serde_json::from_str(response_body(&http_get(port, "/version").await)).unwrap();
    assert_eq!(version["name"], "toolgate");
}

#[tokio::test]
async fn test_event_stream_pushes_transitions() {
    let upstream = mock_upstream().await;
    let manager = build_manager("", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_with_api(&manager).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    stream
        .write_all(format!("GET /api/events HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", port).as_bytes())
        .await
        .unwrap();
    let (head, mut received) = read_head(&mut stream).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.to_lowercase().contains("content-type: text/event-stream"));
    assert_eq!(manager.hub().client_count(), 1);

    let instance = manager.start("echo", LaunchContext::empty()).unwrap();

    let mut chunk = [0u8; 1024];
    let started = format!("\"instanceId\":\"{}\",\"statusId\":\"started\"", instance.id());
    while !String::from_utf8_lossy(&received).contains(&started) {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("no started event")
            .unwrap();
        assert!(n > 0);
        received.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("event: status\n"));
    assert!(text.contains("\"statusId\":\"waiting-for-port\""));

    drop(stream);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.hub().client_count() > 0 && tokio::time::Instant::now() < deadline {
        // The hub notices on the next publish or when hyper drops the body
        manager.hub().publish(&InstanceStatus::new("probe", StatusId::Starting));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(manager.hub().client_count(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_follower_reconciles_and_follows() {
    let upstream = mock_upstream().await;
    let manager = build_manager("/ide", vec![Arc::new(UpstreamKind::new("echo", upstream))]);
    let (port, _shutdown) = start_with_api(&manager).await;

    let running = manager.start("echo", LaunchContext::empty()).unwrap();
    wait_for_status(&running, StatusId::Started).await;

    let follower = Arc::new(
        StatusFollower::new(&format!("http://127.0.0.1:{}/ide", port))
            .unwrap()
            .with_backoff(Duration::from_millis(20), Duration::from_millis(200)),
    );

    // Left over from an earlier session: the supervisor no longer has it
    let ghost = InstanceStatus::new("999", StatusId::Started);
    assert!(follower.cache().apply(ghost.clone()));

    let mut updates = follower.subscribe();
    let cancel = CancellationToken::new();
    let task = {
        let follower = Arc::clone(&follower);
        let cancel = cancel.clone();
        tokio::spawn(async move { follower.run(cancel).await })
    };

    let mut ghost_errored = false;
    let mut running_started = false;
    while !(ghost_errored && running_started) {
        let status = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("no update from follower")
            .unwrap();
        if status.instance_id == "999" {
            assert_eq!(status.status_id, StatusId::Errored);
            assert_eq!(status.status_message.as_deref(), Some(INSTANCE_GONE_MESSAGE));
            assert!(status.time_ms > ghost.time_ms);
            ghost_errored = true;
        }
        if status.instance_id == running.id() && status.status_id == StatusId::Started {
            running_started = true;
        }
    }
    assert!(follower.cache().get("999").is_none());

    // Live transitions arrive over the stream
    let fresh = manager.start("echo", LaunchContext::from(json!({"n": 2}))).unwrap();
    loop {
        let status = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("no live update")
            .unwrap();
        if status.instance_id == fresh.id() && status.status_id == StatusId::Started {
            break;
        }
    }
    assert_eq!(
        follower.cache().get(fresh.id()).map(|s| s.status_id),
        Some(StatusId::Started)
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    manager.shutdown().await;
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_config_defined_kind_starts_and_stops() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
home_path = "/ide"

[defaults]
health_check_interval_ms = 50
startup_timeout_secs = 30
stop_timeout_secs = 2

[kinds.sleeper]
name = "Sleeper"
command = "sleep 30"
env = {{ WORKSPACE = "{{context.workspace}}" }}
path_mode = "preserve"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.home_path, "/ide");

    let registry = Registry::from_config(&config).unwrap();
    assert_eq!(registry.get("sleeper").unwrap().name(), "Sleeper");

    let manager = InstanceManager::new(
        registry,
        PathManager::new(&config.server.home_path),
        config.defaults.timings(),
        Arc::new(StatusHub::new()),
    );
    assert_eq!(
        manager.proxy_options("sleeper").unwrap().path_mode,
        PathMode::Preserve
    );

    // The template needs a workspace in the context
    let err = manager.start("sleeper", LaunchContext::empty()).unwrap_err();
    assert!(err.to_string().contains("workspace"), "error: {}", err);
    assert!(manager.is_empty());

    let instance = manager
        .start("sleeper", LaunchContext::from(json!({"workspace": "/tmp"})))
        .unwrap();
    wait_for_status(&instance, StatusId::WaitingForPort).await;
    assert!(instance.pid().is_some());

    assert!(manager.stop(instance.id()).await);
    assert_eq!(instance.status().status_id, StatusId::Stopped);
    assert!(manager.is_empty());
}

#[test]
fn test_config_rejects_invalid_kinds() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
port = 0

[kinds.broken]
command = []
"#
    )
    .unwrap();

    let err = Config::load(file.path()).unwrap_err().to_string();
    assert!(err.contains("port"), "error: {}", err);
    assert!(err.contains("broken"), "error: {}", err);
}
