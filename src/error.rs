//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Process-level failures from the supervisor and coordinator
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend executable is missing or could not be spawned
    #[error("failed to launch backend '{command}': {reason}")]
    Launch { command: String, reason: String },

    /// Backend spawned but exited during the warm-up window
    #[error("backend '{command}' exited immediately ({status})")]
    ExitedImmediately { command: String, status: String },

    /// Requested port is already bound by another process
    #[error("port {port} is already in use")]
    PortUnavailable { port: u16 },

    /// Binding a privileged port was refused
    #[error("permission denied binding port {port} (ports below 1024 usually need elevated privileges)")]
    PermissionDenied { port: u16 },

    /// Document root does not exist or is not a directory
    #[error("document root '{}' is not a directory", .0.display())]
    DocumentRoot(PathBuf),

    /// Backend survived SIGTERM and could not be killed
    #[error("backend process {pid} could not be terminated: {reason}")]
    ProcessTermination { pid: u32, reason: String },

    /// Coordinator was asked to start more than once
    #[error("coordinator has already been started")]
    AlreadyStarted,

    /// Start or restart requested after shutdown began
    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the backend could not be brought up at all
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Error::Launch { .. } | Error::ExitedImmediately { .. })
    }
}

/// Error codes for per-request proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend refused, reset, or timed out
    BackendUnreachable,
    /// Malformed inbound request or unexpected I/O error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::BackendUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            ProxyErrorCode::BackendUnreachable,
            "Bad Gateway: connection refused",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"BACKEND_UNREACHABLE\""));
        assert!(json.contains("\"message\":\"Bad Gateway: connection refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::InternalError, "Internal Server Error");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_process_error_messages() {
        let err = Error::PortUnavailable { port: 8000 };
        assert_eq!(err.to_string(), "port 8000 is already in use");

        let err = Error::Launch {
            command: "php".to_string(),
            reason: "executable not found".to_string(),
        };
        assert!(err.is_launch_failure());
        assert!(err.to_string().contains("php"));

        assert!(!Error::ShuttingDown.is_launch_failure());
    }
}
