//! Supervisor errors and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::io;

/// Configuration-class failures of the supervisor.
///
/// Process crashes and health check timeouts are not errors: they surface as
/// `errored`/`stopped` instance statuses.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown server proxy kind '{0}'")]
    UnknownKind(String),

    #[error("server proxy kind '{0}' produced an empty command")]
    EmptyCommand(String),

    #[error("server proxy kind '{kind}' failed to build its command: {message}")]
    CommandBuild { kind: String, message: String },

    #[error("failed to allocate a port: {0}")]
    PortAllocation(#[from] io::Error),

    #[error("server proxy kind '{0}' is registered twice")]
    DuplicateKind(String),
}

impl SupervisorError {
    /// Stable code for HTTP surfaces
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            SupervisorError::UnknownKind(_) => ProxyErrorCode::UnknownKind,
            SupervisorError::EmptyCommand(_)
            | SupervisorError::CommandBuild { .. }
            | SupervisorError::DuplicateKind(_) => ProxyErrorCode::KindMisconfigured,
            SupervisorError::PortAllocation(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// Error codes for proxy and API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No kind registered under the requested id
    UnknownKind,
    /// The kind's command could not be built
    KindMisconfigured,
    /// Instance does not exist or is no longer live
    InstanceUnavailable,
    /// Failed to connect to the instance
    ConnectionFailed,
    /// Request timed out waiting for the instance
    RequestTimeout,
    /// Malformed request
    BadRequest,
    /// No route for the request
    NotFound,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownKind => StatusCode::NOT_FOUND,
            ProxyErrorCode::KindMisconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InstanceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownKind => "UNKNOWN_KIND",
            ProxyErrorCode::KindMisconfigured => "KIND_MISCONFIGURED",
            ProxyErrorCode::InstanceUnavailable => "INSTANCE_UNAVAILABLE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
