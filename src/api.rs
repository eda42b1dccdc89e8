//! Control API served behind the front door
//!
//! Lists kinds and instances, starts and stops instances, and streams status
//! transitions to frontends as server-sent events.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::manager::InstanceManager;
use crate::proxy::{Fallback, ProxyBody};
use crate::registry::LaunchContext;
use crate::status::InstanceStatus;
use crate::sync::{ClientId, StatusHub, DEFAULT_CLIENT_BUFFER};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Version information for the supervisor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted by the API
const MAX_BODY_BYTES: usize = 64 * 1024;

const INSTANCE_PREFIX: &str = "/api/instances/";

/// Body of `POST /api/instances`
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub kind: String,
    #[serde(default = "LaunchContext::empty")]
    pub context: LaunchContext,
    /// Reuse a live instance with the same context instead of starting anew
    #[serde(default = "default_reuse")]
    pub reuse: bool,
}

fn default_reuse() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct KindInfo<'a> {
    id: &'a str,
    name: &'a str,
}

/// JSON API over the instance manager. Mounted as the front door's fallback.
#[derive(Clone)]
pub struct ControlApi {
    manager: Arc<InstanceManager>,
}

impl ControlApi {
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }

    async fn handle_request(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
            (&Method::GET, "/version") => {
                let version = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                json_response(StatusCode::OK, version.to_string())
            }
            (&Method::GET, "/api/kinds") => self.list_kinds(),
            (&Method::GET, "/api/instances") => {
                let kind = req.uri().query().and_then(|q| query_param(q, "kind"));
                self.list_instances(kind.as_deref())
            }
            (&Method::POST, "/api/instances") => self.start_instance(req).await,
            (&Method::GET, "/api/events") => self.events(),
            (&Method::GET, p) if p.starts_with(INSTANCE_PREFIX) => {
                self.get_instance(&p[INSTANCE_PREFIX.len()..])
            }
            (&Method::DELETE, p) if p.starts_with(INSTANCE_PREFIX) => {
                self.stop_instance(&p[INSTANCE_PREFIX.len()..]).await
            }
            _ => json_error_response(ProxyErrorCode::NotFound, "Not found"),
        }
    }

    fn list_kinds(&self) -> Response<ProxyBody> {
        let kinds: Vec<KindInfo<'_>> = self
            .manager
            .registry()
            .iter()
            .map(|kind| KindInfo {
                id: kind.id(),
                name: kind.name(),
            })
            .collect();
        to_json_response(StatusCode::OK, &kinds)
    }

    fn list_instances(&self, kind: Option<&str>) -> Response<ProxyBody> {
        let instances = match kind {
            Some(kind) => self.manager.get_by_kind(kind),
            None => self.manager.list(),
        };
        let infos: Vec<_> = instances.iter().map(|i| i.snapshot()).collect();
        to_json_response(StatusCode::OK, &infos)
    }

    fn get_instance(&self, id: &str) -> Response<ProxyBody> {
        match self.manager.get(id) {
            Some(instance) => to_json_response(StatusCode::OK, &instance.snapshot()),
            None => json_error_response(
                ProxyErrorCode::NotFound,
                format!("Instance '{}' not found", id),
            ),
        }
    }

    async fn start_instance(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return json_error_response(
                    ProxyErrorCode::BadRequest,
                    format!("Failed to read request body: {}", e),
                )
            }
        };

        let request: StartRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return json_error_response(
                    ProxyErrorCode::BadRequest,
                    format!("Invalid request: {}", e),
                )
            }
        };

        let result = if request.reuse {
            self.manager.get_or_create(&request.kind, request.context)
        } else {
            self.manager.start(&request.kind, request.context)
        };

        match result {
            Ok(instance) => {
                info!(instance_id = instance.id(), kind = instance.kind(), "Instance requested via API");
                to_json_response(StatusCode::OK, &instance.snapshot())
            }
            Err(e) => json_error_response(e.code(), e.to_string()),
        }
    }

    async fn stop_instance(&self, id: &str) -> Response<ProxyBody> {
        if self.manager.get(id).is_none() {
            return json_error_response(
                ProxyErrorCode::NotFound,
                format!("Instance '{}' not found", id),
            );
        }
        let stopped = self.manager.stop(id).await;
        json_response(
            StatusCode::OK,
            serde_json::json!({ "stopped": stopped }).to_string(),
        )
    }

    fn events(&self) -> Response<ProxyBody> {
        let hub = Arc::clone(self.manager.hub());
        let (id, rx) = hub.connect_channel(DEFAULT_CLIENT_BUFFER);
        debug!(client_id = id, "Status event stream opened");

        let body = EventStream {
            greeting: Some(Bytes::from_static(b": connected\n\n")),
            rx,
            _client: HubClient { hub, id },
        };

        let mut response = Response::new(body.boxed());
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(
            CACHE_CONTROL,
            hyper::header::HeaderValue::from_static("no-cache"),
        );
        response
    }
}

impl Fallback for ControlApi {
    fn handle(
        &self,
        req: Request<Incoming>,
        _client_addr: SocketAddr,
    ) -> BoxFuture<'static, Response<ProxyBody>> {
        let api = self.clone();
        Box::pin(api.handle_request(req))
    }
}

/// Hub registration that lasts as long as the event stream body
struct HubClient {
    hub: Arc<StatusHub>,
    id: ClientId,
}

impl Drop for HubClient {
    fn drop(&mut self) {
        if self.hub.disconnect(self.id) {
            debug!(client_id = self.id, "Status event stream closed");
        }
    }
}

/// `text/event-stream` body carrying one record per status transition
struct EventStream {
    greeting: Option<Bytes>,
    rx: mpsc::Receiver<InstanceStatus>,
    _client: HubClient,
}

impl Body for EventStream {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        if let Some(greeting) = self.greeting.take() {
            return Poll::Ready(Some(Ok(Frame::data(greeting))));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(status)) => {
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(sse_record(&status))))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Encode one status as a server-sent event
pub fn sse_record(status: &InstanceStatus) -> String {
    let data = serde_json::to_string(status).unwrap_or_default();
    format!("event: status\ndata: {}\n\n", data)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn to_json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(status, body),
        Err(e) => json_error_response(
            ProxyErrorCode::InternalError,
            format!("Failed to encode response: {}", e),
        ),
    }
}
