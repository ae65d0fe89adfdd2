//! Request middleware run before a route's handler.
//!
//! Middlewares are registered by name and referenced from routes. The global
//! chain runs first, then the route's own list, in order. The first error
//! stops the chain and is rendered by the gateway's error envelope.

use crate::context::RequestContext;
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method, Uri};
use hyper::body::Bytes;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// A buffered inbound request as seen by middlewares and the forwarder.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub ctx: RequestContext,
    /// Set by an authentication middleware.
    pub identity: Option<String>,
    /// Set by [`JsonBody`].
    pub json: Option<Value>,
}

impl GatewayRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        let ctx = RequestContext::from_headers(&headers);
        Self {
            method,
            uri,
            headers,
            body,
            remote_addr: None,
            ctx,
            identity: None,
            json: None,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Token of an `Authorization: Bearer <token>` header.
    fn bearer_token(&self) -> Result<&str> {
        let header = self
            .header_str(AUTHORIZATION.as_str())
            .ok_or_else(|| MeshError::Unauthorized("missing bearer token".into()))?;
        header
            .split_once(' ')
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| MeshError::Unauthorized("malformed authorization header".into()))
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()>;
}

/// Maps bearer tokens to identities.
#[derive(Default)]
pub struct BearerAuth {
    tokens: HashMap<String, String>,
}

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAuth")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl BearerAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), identity.into());
        self
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()> {
        let identity = self
            .tokens
            .get(request.bearer_token()?)
            .ok_or_else(|| MeshError::Unauthorized("invalid token".into()))?;

        debug!(identity = %identity, "request authenticated");
        request.identity = Some(identity.clone());
        Ok(())
    }
}

/// Maps API keys carried in a request header to identities.
pub struct ApiKeyAuth {
    header: String,
    keys: HashMap<String, String>,
}

impl Default for ApiKeyAuth {
    fn default() -> Self {
        Self {
            header: "x-api-key".to_string(),
            keys: HashMap::new(),
        }
    }
}

impl fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("header", &self.header)
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl ApiKeyAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the key from `name` instead of `x-api-key`.
    pub fn with_header(mut self, name: impl Into<String>) -> Self {
        self.header = name.into().to_ascii_lowercase();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>, identity: impl Into<String>) -> Self {
        self.keys.insert(key.into(), identity.into());
        self
    }
}

#[async_trait]
impl Middleware for ApiKeyAuth {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()> {
        let key = request
            .header_str(&self.header)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| MeshError::Unauthorized(format!("missing {} header", self.header)))?;

        let identity = self
            .keys
            .get(key)
            .ok_or_else(|| MeshError::Unauthorized("invalid API key".into()))?;

        debug!(identity = %identity, "request authenticated by API key");
        request.identity = Some(identity.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies HS256-signed bearer JWTs and takes the identity from `sub`.
///
/// `exp` is required and checked with the library's default leeway.
#[derive(Clone)]
pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth")
            .field("algorithms", &self.validation.algorithms)
            .field("issuer", &self.validation.iss)
            .finish()
    }
}

impl JwtAuth {
    pub fn hs256(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Only accepts tokens whose `iss` claim is `issuer`.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_leeway(mut self, leeway: std::time::Duration) -> Self {
        self.validation.leeway = leeway.as_secs();
        self
    }
}

#[async_trait]
impl Middleware for JwtAuth {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()> {
        let token = request.bearer_token()?;
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => MeshError::Unauthorized("token expired".into()),
                _ => MeshError::Unauthorized(format!("invalid token: {}", e)),
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(MeshError::Unauthorized("token has no subject".into()));
        }

        debug!(identity = %data.claims.sub, "request authenticated by JWT");
        request.identity = Some(data.claims.sub);
        Ok(())
    }
}

/// Parses a JSON body into [`GatewayRequest::json`].
///
/// Empty bodies pass through untouched.
#[derive(Debug, Clone)]
pub struct JsonBody {
    max_bytes: usize,
}

impl JsonBody {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Default for JsonBody {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

fn parse_json(body: &Bytes) -> Result<Value> {
    serde_json::from_slice(body)
        .map_err(|e| MeshError::BadRequest(format!("invalid JSON body: {}", e)))
}

#[async_trait]
impl Middleware for JsonBody {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()> {
        if request.body.is_empty() {
            return Ok(());
        }
        if request.body.len() > self.max_bytes {
            return Err(MeshError::BadRequest(format!(
                "request body exceeds {} bytes",
                self.max_bytes
            )));
        }
        if let Some(content_type) = request.header_str(CONTENT_TYPE.as_str()) {
            if !content_type.to_ascii_lowercase().contains("json") {
                return Err(MeshError::BadRequest(format!(
                    "expected a JSON body, got {}",
                    content_type
                )));
            }
        }
        request.json = Some(parse_json(&request.body)?);
        Ok(())
    }
}

/// Requires the listed top-level fields in a JSON object body.
#[derive(Debug, Clone)]
pub struct RequireJsonFields {
    fields: Vec<String>,
}

impl RequireJsonFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Middleware for RequireJsonFields {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()> {
        if request.json.is_none() && !request.body.is_empty() {
            request.json = Some(parse_json(&request.body)?);
        }
        let object = request
            .json
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| MeshError::Validation("request body must be a JSON object".into()))?;

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(MeshError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// Rejects requests missing any of the listed headers.
#[derive(Debug, Clone)]
pub struct RequireHeaders {
    names: Vec<String>,
}

impl RequireHeaders {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl Middleware for RequireHeaders {
    async fn handle(&self, request: &mut GatewayRequest) -> Result<()> {
        match self.names.iter().find(|n| !request.headers.contains_key(n.as_str())) {
            Some(name) => Err(MeshError::BadRequest(format!(
                "missing required header {}",
                name
            ))),
            None => Ok(()),
        }
    }
}

/// Named middlewares plus the global chain.
#[derive(Default)]
pub struct MiddlewareRegistry {
    named: RwLock<HashMap<String, Arc<dyn Middleware>>>,
    global: RwLock<Vec<String>>,
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.named.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("MiddlewareRegistry")
            .field("named", &names)
            .field("global", &*self.global.read())
            .finish()
    }
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `middleware` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.named.write().insert(name.into(), middleware);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named.read().contains_key(name)
    }

    /// Fails on the first unknown name.
    pub fn ensure_known(&self, names: &[String]) -> Result<()> {
        let named = self.named.read();
        match names.iter().find(|n| !named.contains_key(n.as_str())) {
            Some(unknown) => Err(MeshError::Validation(format!(
                "unknown middleware {}",
                unknown
            ))),
            None => Ok(()),
        }
    }

    /// Appends `name` to the global chain.
    pub fn use_global(&self, name: &str) -> Result<()> {
        self.ensure_known(&[name.to_string()])?;
        let mut global = self.global.write();
        if !global.iter().any(|n| n == name) {
            global.push(name.to_string());
        }
        Ok(())
    }

    /// Global chain followed by `route`'s own middlewares.
    pub fn chain(&self, route: &[String]) -> Result<Vec<Arc<dyn Middleware>>> {
        let named = self.named.read();
        let global = self.global.read();
        global
            .iter()
            .chain(route.iter())
            .map(|name| {
                named.get(name).cloned().ok_or_else(|| {
                    MeshError::InvalidConfig(format!("middleware {} is not registered", name))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request(body: &'static str) -> GatewayRequest {
        GatewayRequest::new(
            Method::POST,
            Uri::from_static("/orders"),
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let auth = BearerAuth::new().with_token("s3cret", "alice");

        let mut req = request("");
        let err = auth.handle(&mut req).await.unwrap_err();
        assert!(matches!(err, MeshError::Unauthorized(_)));

        req.headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(auth.handle(&mut req).await.is_err());

        req.headers
            .insert(AUTHORIZATION, HeaderValue::from_static("bearer s3cret"));
        auth.handle(&mut req).await.unwrap();
        assert_eq!(req.identity.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_api_key_auth() {
        let auth = ApiKeyAuth::new().with_key("k-123", "billing");

        let mut req = request("");
        assert!(matches!(
            auth.handle(&mut req).await,
            Err(MeshError::Unauthorized(_))
        ));

        req.headers
            .insert("x-api-key", HeaderValue::from_static("k-999"));
        assert!(auth.handle(&mut req).await.is_err());

        req.headers
            .insert("x-api-key", HeaderValue::from_static("k-123"));
        auth.handle(&mut req).await.unwrap();
        assert_eq!(req.identity.as_deref(), Some("billing"));

        let custom = ApiKeyAuth::new()
            .with_header("X-Service-Key")
            .with_key("k-123", "billing");
        let mut req = request("");
        req.headers
            .insert("x-api-key", HeaderValue::from_static("k-123"));
        assert!(custom.handle(&mut req).await.is_err());
        req.headers
            .insert("x-service-key", HeaderValue::from_static("k-123"));
        custom.handle(&mut req).await.unwrap();
    }

    fn jwt(secret: &[u8], claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    fn with_bearer(token: &str) -> GatewayRequest {
        let mut req = request("");
        req.headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        req
    }

    #[tokio::test]
    async fn test_jwt_auth() {
        let auth = JwtAuth::hs256("mesh-secret");
        let exp = chrono::Utc::now().timestamp() + 600;

        let claims = serde_json::json!({"sub": "carol", "exp": exp});
        let mut req = with_bearer(&jwt(b"mesh-secret", claims.clone()));
        auth.handle(&mut req).await.unwrap();
        assert_eq!(req.identity.as_deref(), Some("carol"));

        let mut forged = with_bearer(&jwt(b"other-secret", claims));
        let err = auth.handle(&mut forged).await.unwrap_err();
        assert!(matches!(err, MeshError::Unauthorized(_)));
        assert!(forged.identity.is_none());

        let mut no_exp = with_bearer(&jwt(b"mesh-secret", serde_json::json!({"sub": "carol"})));
        assert!(auth.handle(&mut no_exp).await.is_err());

        let mut garbage = with_bearer("not.a.jwt");
        assert!(auth.handle(&mut garbage).await.is_err());

        let mut missing = request("");
        assert!(auth.handle(&mut missing).await.is_err());
    }

    #[tokio::test]
    async fn test_jwt_auth_rejects_expired_and_foreign_issuer() {
        let expired_at = chrono::Utc::now().timestamp() - 3600;
        let auth = JwtAuth::hs256("mesh-secret");
        let mut expired = with_bearer(&jwt(
            b"mesh-secret",
            serde_json::json!({"sub": "dave", "exp": expired_at}),
        ));
        let err = auth.handle(&mut expired).await.unwrap_err();
        assert_eq!(err.to_string(), "unauthorized: token expired");

        let exp = chrono::Utc::now().timestamp() + 600;
        let scoped = JwtAuth::hs256("mesh-secret").with_issuer("meshplane");
        let mut foreign = with_bearer(&jwt(
            b"mesh-secret",
            serde_json::json!({"sub": "dave", "exp": exp, "iss": "elsewhere"}),
        ));
        assert!(scoped.handle(&mut foreign).await.is_err());
        let mut local = with_bearer(&jwt(
            b"mesh-secret",
            serde_json::json!({"sub": "dave", "exp": exp, "iss": "meshplane"}),
        ));
        scoped.handle(&mut local).await.unwrap();
        assert_eq!(local.identity.as_deref(), Some("dave"));
    }

    #[tokio::test]
    async fn test_json_body() {
        let mut req = request(r#"{"item":"book","qty":2}"#);
        JsonBody::default().handle(&mut req).await.unwrap();
        assert_eq!(req.json.as_ref().unwrap()["qty"], 2);

        let mut bad = request("{not json");
        let err = JsonBody::default().handle(&mut bad).await.unwrap_err();
        assert!(matches!(err, MeshError::BadRequest(_)));

        let mut big = request(r#"{"a":1}"#);
        assert!(JsonBody::new(3).handle(&mut big).await.is_err());

        let mut text = request("hello");
        text.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(JsonBody::default().handle(&mut text).await.is_err());
    }

    #[tokio::test]
    async fn test_require_json_fields() {
        let check = RequireJsonFields::new(["item", "qty"]);

        let mut ok = request(r#"{"item":"book","qty":2}"#);
        check.handle(&mut ok).await.unwrap();

        let mut partial = request(r#"{"item":"book"}"#);
        let err = check.handle(&mut partial).await.unwrap_err();
        assert!(err.to_string().contains("qty"));

        let mut array = request("[1,2]");
        assert!(matches!(
            check.handle(&mut array).await,
            Err(MeshError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_require_headers() {
        let check = RequireHeaders::new(["X-Tenant"]);
        let mut req = request("");
        assert!(check.handle(&mut req).await.is_err());
        req.headers
            .insert("x-tenant", HeaderValue::from_static("acme"));
        check.handle(&mut req).await.unwrap();
    }

    #[test]
    fn test_chain_order_and_unknown_names() {
        let registry = MiddlewareRegistry::new();
        registry.register("auth", Arc::new(BearerAuth::new()));
        registry.register("json", Arc::new(JsonBody::default()));

        assert!(registry.use_global("missing").is_err());
        registry.use_global("auth").unwrap();
        registry.use_global("auth").unwrap();

        let chain = registry.chain(&["json".to_string()]).unwrap();
        assert_eq!(chain.len(), 2);

        assert!(registry.ensure_known(&["nope".to_string()]).is_err());
        assert!(registry.chain(&["nope".to_string()]).is_err());
    }
}
