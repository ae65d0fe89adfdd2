//! Upstream request construction and the pooled HTTP client.

use super::middleware::GatewayRequest;
use crate::context::CORRELATION_HEADER;
use crate::error::{MeshError, Result};
use http::header::HOST;
use http::{HeaderValue, Request, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

pub(crate) type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn new_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Upstream path plus the original query string.
pub(crate) fn path_and_query(path: &str, uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

/// Joins a static base URL and a request path without doubling the slash.
pub(crate) fn join_url(base: &str, path_and_query: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

/// Copies method, end-to-end headers and body onto a request for `target`.
///
/// The correlation id is always propagated and the client address is
/// appended to `x-forwarded-for`.
pub(crate) fn build_upstream_request(
    request: &GatewayRequest,
    target: &str,
) -> Result<Request<Full<Bytes>>> {
    let uri: Uri = target.parse().map_err(|e| MeshError::BadGateway {
        upstream: target.to_string(),
        message: format!("invalid upstream uri: {}", e),
    })?;

    let mut builder = Request::builder().method(request.method.clone()).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in request.headers.iter() {
            if name == HOST || HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Ok(id) = HeaderValue::from_str(request.ctx.correlation_id()) {
            headers.insert(CORRELATION_HEADER, id);
        }

        if let Some(addr) = request.remote_addr {
            let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(previous) => format!("{}, {}", previous, addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }
    }

    Ok(builder.body(Full::new(request.body.clone()))?)
}
