//! Error types for the mesh control plane.
//!
//! Every failure a caller can observe maps onto one class of the taxonomy
//! (validation, not-found, unavailable, timeout, rate-limited) so the gateway
//! can render a uniform error envelope with a stable machine-readable code.

use http::StatusCode;
use std::fmt;
use std::io;
use thiserror::Error;

/// Why a service could not be reached.
///
/// All of these surface to callers as the same "unavailable" class; the reason
/// is diagnostic detail only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Discovery returned zero passing instances.
    NoHealthyInstances,
    /// The service's circuit breaker rejected the call.
    CircuitOpen,
    /// The forwarded call exceeded its budget.
    Timeout { duration_ms: u64 },
    /// The upstream could not be reached.
    Upstream(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::NoHealthyInstances => write!(f, "no healthy instances"),
            UnavailableReason::CircuitOpen => write!(f, "circuit breaker open"),
            UnavailableReason::Timeout { duration_ms } => {
                write!(f, "timed out after {}ms", duration_ms)
            }
            UnavailableReason::Upstream(msg) => write!(f, "upstream error: {}", msg),
        }
    }
}

/// Errors that can occur during control-plane operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Malformed descriptor, route or request. Rejected before any state mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown service or other named entity.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// No route matched the request.
    #[error("no route found for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The target service has no usable instance or its breaker is open.
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable {
        service: String,
        reason: UnavailableReason,
    },

    /// An operation exceeded its time budget.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Request denied by a rate limiter.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64, limit: usize },

    /// Authentication failed in the middleware chain.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request body could not be read or parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A static upstream failed outside of any circuit breaker.
    #[error("upstream {upstream} failed: {message}")]
    BadGateway { upstream: String, message: String },

    /// The registry answered with an unexpected status or payload.
    #[error("registry error: {0}")]
    Registry(String),

    /// Transport failure talking to the registry.
    #[error("registry transport error: {0}")]
    RegistryTransport(#[from] reqwest::Error),

    /// Failed to bind the gateway listener.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Building an HTTP message failed.
    #[error("http build error: {0}")]
    HttpBuild(#[from] http::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshError {
    /// Shorthand for a not-found service.
    pub fn service_not_found(name: impl Into<String>) -> Self {
        MeshError::NotFound {
            kind: "service",
            name: name.into(),
        }
    }

    /// Shorthand for an unavailable service.
    pub fn unavailable(service: impl Into<String>, reason: UnavailableReason) -> Self {
        MeshError::ServiceUnavailable {
            service: service.into(),
            reason,
        }
    }

    /// Machine-readable error code used in the gateway error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::Validation(_) => "VALIDATION_ERROR",
            MeshError::NotFound { .. } | MeshError::RouteNotFound { .. } => "NOT_FOUND",
            MeshError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            MeshError::Timeout { .. } => "TIMEOUT",
            MeshError::RateLimited { .. } => "RATE_LIMITED",
            MeshError::Unauthorized(_) => "UNAUTHORIZED",
            MeshError::BadRequest(_) => "BAD_REQUEST",
            MeshError::BadGateway { .. } => "BAD_GATEWAY",
            _ => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the gateway answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MeshError::NotFound { .. } | MeshError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            MeshError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MeshError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            MeshError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            MeshError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MeshError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MeshError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a client.
    ///
    /// Internal failures collapse to a generic message so no source chain leaks.
    pub fn public_message(&self) -> String {
        match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classes_share_code() {
        let open = MeshError::unavailable("orders", UnavailableReason::CircuitOpen);
        let empty = MeshError::unavailable("orders", UnavailableReason::NoHealthyInstances);

        assert_eq!(open.code(), empty.code());
        assert_eq!(open.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(open.to_string().contains("orders"));
        assert!(empty.to_string().contains("no healthy instances"));
    }

    #[test]
    fn test_rate_limited_status() {
        let err = MeshError::RateLimited {
            retry_after_secs: 3,
            limit: 10,
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "RATE_LIMITED");
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = MeshError::Io(io::Error::other("disk on fire"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn test_not_found_message() {
        let err = MeshError::service_not_found("payments");
        assert_eq!(err.to_string(), "service not found: payments");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
