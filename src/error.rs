//! Error taxonomy for the site host and JSON error responses for clients

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors raised by the tenant cache, the task coordinator and their collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No live, servable tenant matches the reference
    #[error("no servable tenant for {0}")]
    TenantNotFound(String),

    /// The instance factory failed to build an instance
    #[error("failed to build instance for tenant {tenant_id}: {message}")]
    BuildFailure { tenant_id: String, message: String },

    /// The build exceeded the maximum build duration and was abandoned
    #[error("build for tenant {tenant_id} did not finish within {timeout:?}")]
    BuildTimeout { tenant_id: String, timeout: Duration },

    /// Tearing down an instance failed (logged, never fatal)
    #[error("teardown of tenant {tenant_id} failed: {message}")]
    TeardownFailure { tenant_id: String, message: String },

    /// The handle started tearing down before the dispatch could begin
    #[error("instance for tenant {0} is no longer serving")]
    InstanceRetired(String),

    /// Forwarding a request to a ready instance failed
    #[error("dispatch to tenant {tenant_id} failed: {message}")]
    Dispatch { tenant_id: String, message: String },

    /// The dispatch did not complete within the request timeout
    #[error("request to tenant {tenant_id} timed out after {timeout:?}")]
    DispatchTimeout { tenant_id: String, timeout: Duration },

    /// The distributed lock could not be taken
    #[error("lock {key} unavailable: {message}")]
    LockUnavailable { key: String, message: String },

    /// The distributed lock was still held by someone else when the wait ran out
    #[error("timed out waiting {waited:?} for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    /// A maintenance task failed for one target
    #[error("task {task} failed for tenant {tenant_id}: {message}")]
    TaskFailed {
        task: String,
        tenant_id: String,
        message: String,
    },

    /// The shared store returned an error
    #[error("store error: {0}")]
    Store(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Store(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes sent to clients
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Hostname matches no servable site
    UnknownHost,
    /// Site instance could not be built
    SiteStartFailed,
    /// Request timed out waiting for the site
    RequestTimeout,
    /// Site instance failed while handling the request
    SiteError,
    /// Internal host error
    InternalError,
}

impl SiteErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            SiteErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            SiteErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            SiteErrorCode::SiteStartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            SiteErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            SiteErrorCode::SiteError => StatusCode::INTERNAL_SERVER_ERROR,
            SiteErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Multisite-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            SiteErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            SiteErrorCode::UnknownHost => "UNKNOWN_HOST",
            SiteErrorCode::SiteStartFailed => "SITE_START_FAILED",
            SiteErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            SiteErrorCode::SiteError => "SITE_ERROR",
            SiteErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&Error> for SiteErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::TenantNotFound(_) => SiteErrorCode::UnknownHost,
            Error::BuildFailure { .. } | Error::BuildTimeout { .. } => SiteErrorCode::SiteStartFailed,
            Error::DispatchTimeout { .. } => SiteErrorCode::RequestTimeout,
            Error::Dispatch { .. } | Error::InstanceRetired(_) => SiteErrorCode::SiteError,
            _ => SiteErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: SiteErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: SiteErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Multisite-Error header
pub fn json_error_response(
    code: SiteErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-multisite-error",
        HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            SiteErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(SiteErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            SiteErrorCode::SiteStartFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SiteErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_maps_to_code() {
        let err = Error::BuildFailure {
            tenant_id: "abc".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(SiteErrorCode::from(&err).as_header_value(), "SITE_START_FAILED");

        let err = Error::InstanceRetired("abc".to_string());
        assert_eq!(SiteErrorCode::from(&err).as_header_value(), "SITE_ERROR");

        let err = Error::Store("disk".to_string());
        assert_eq!(SiteErrorCode::from(&err).as_header_value(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(SiteErrorCode::UnknownHost, "Unknown site");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"Unknown site\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(SiteErrorCode::SiteError, "error");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Multisite-Error").unwrap(), "SITE_ERROR");
    }

    #[test]
    fn test_error_display_includes_tenant() {
        let err = Error::TaskFailed {
            task: "reindex".to_string(),
            tenant_id: "site-1".to_string(),
            message: "exit status 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "task reindex failed for tenant site-1: exit status 2"
        );
    }
}
