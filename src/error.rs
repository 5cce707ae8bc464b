//! Error handling and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Body type shared by every response the server produces
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Header carrying the error code on error responses
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for responses generated by the front-end itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend could not be reached (refused, DNS, timeout)
    BackendUnavailable,
    /// Inbound request body could not be read
    InvalidRequest,
    /// Static root document is missing
    NotFound,
    /// Non-GET/HEAD request outside the proxy prefix
    MethodNotAllowed,
    /// Internal front-end error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short caller-facing description, used as the `error` field
    pub fn description(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendUnavailable => "Backend service unavailable",
            ProxyErrorCode::InvalidRequest => "Invalid request",
            ProxyErrorCode::NotFound => "Not found",
            ProxyErrorCode::MethodNotAllowed => "Method not allowed",
            ProxyErrorCode::InternalError => "Internal server error",
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Short description of what failed
    pub error: String,
    /// Human-readable detail for the operator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The error code
    pub code: ProxyErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: Option<String>) -> Self {
        Self {
            error: code.description().to_string(),
            message,
            code,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                self.error,
                self.code.as_header_value()
            )
        })
    }
}

/// Wrap a complete buffer into the shared response body type
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    let message = message.into();
    let error = ErrorResponse::new(code, (!message.is_empty()).then_some(message));

    let mut response = Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers");

    if code == ProxyErrorCode::MethodNotAllowed {
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
    }

    response
}

/// Errors raised while resolving a static file
#[derive(Debug, thiserror::Error)]
pub enum StaticFileError {
    /// The single-page root document does not exist
    #[error("root document not found: {}", .0.display())]
    RootDocumentMissing(PathBuf),
    /// The static root directory does not exist or cannot be read
    #[error("static directory unavailable '{}': {source}", .path.display())]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A resolved file could not be read
    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StaticFileError {
    /// Map the error onto the response the caller sees. Filesystem paths stay
    /// in the logs.
    pub fn to_response(&self) -> Response<ResponseBody> {
        match self {
            StaticFileError::RootDocumentMissing(_) | StaticFileError::RootUnavailable { .. } => {
                json_error_response(ProxyErrorCode::NotFound, "Root document not found")
            }
            StaticFileError::Read { .. } => {
                json_error_response(ProxyErrorCode::InternalError, "Failed to read static file")
            }
        }
    }
}
