//! Explicit per-request context.
//!
//! A [`RequestContext`] is created at the gateway entry point (or by a
//! background loop) and passed by reference through registry calls, forwarding
//! and health checks so every log line can carry the same correlation id.

use http::HeaderMap;
use std::fmt;
use uuid::Uuid;

/// Header used to receive and propagate the correlation id.
pub const CORRELATION_HEADER: &str = "x-request-id";

/// Context threaded through every call boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    correlation_id: String,
}

impl RequestContext {
    /// Creates a context with a freshly generated correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context with a caller-supplied correlation id.
    pub fn with_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
        }
    }

    /// Reuses the inbound `x-request-id` when present and sane, otherwise generates one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(Self::with_id)
            .unwrap_or_default()
    }

    /// Context for a background task; the id is prefixed with the task name.
    pub fn background(task: &str) -> Self {
        Self {
            correlation_id: format!("{}-{}", task, Uuid::new_v4()),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_from_headers_reuses_inbound_id() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("abc-123"));
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.correlation_id(), "abc-123");
    }

    #[test]
    fn test_from_headers_generates_when_missing() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert!(Uuid::parse_str(ctx.correlation_id()).is_ok());
    }

    #[test]
    fn test_background_prefix() {
        let ctx = RequestContext::background("health");
        assert!(ctx.correlation_id().starts_with("health-"));
    }
}
