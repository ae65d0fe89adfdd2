//! Consul agent HTTP API backend.

use super::model::{
    AgentService, CheckDefinition, CheckStatus, HealthState, Registration, ServiceInstance,
};
use super::RegistryBackend;
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument};

/// Connection settings for a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub secure: bool,
    /// Per-request timeout for registry calls.
    pub timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8500,
            token: None,
            secure: false,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ConsulConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Registration body for `PUT /v1/agent/service/register`.
#[derive(Debug, Serialize)]
struct ConsulRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: &'a [String],
    #[serde(rename = "Meta")]
    meta: &'a BTreeMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<ConsulCheck<'a>>,
}

#[derive(Debug, Serialize)]
struct ConsulCheck<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<&'a str>,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    interval: Option<&'a str>,
    #[serde(rename = "Timeout", skip_serializing_if = "Option::is_none")]
    timeout: Option<&'a str>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<&'a str>,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_after: &'static str,
}

impl<'a> ConsulCheck<'a> {
    fn from_definition(service: &str, def: &'a CheckDefinition) -> Self {
        let mut check = ConsulCheck {
            check_id: def.check_id(),
            name: format!("{} health check", service),
            http: None,
            interval: None,
            timeout: None,
            ttl: None,
            deregister_critical_after: "1m",
        };
        match def {
            CheckDefinition::Http {
                url,
                interval,
                timeout,
                ..
            } => {
                check.http = Some(url);
                check.interval = Some(interval);
                check.timeout = timeout.as_deref();
            }
            CheckDefinition::Ttl { ttl, .. } => check.ttl = Some(ttl),
        }
        check
    }
}

#[derive(Debug, Serialize)]
struct ConsulCheckUpdate<'a> {
    #[serde(rename = "Status")]
    status: &'a str,
    #[serde(rename = "Output")]
    output: &'a str,
}

/// One entry of `GET /v1/health/service/{name}`.
#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
    #[serde(rename = "Checks", default)]
    checks: Vec<ConsulHealthCheck>,
}

#[derive(Debug, Deserialize)]
struct ConsulNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ConsulHealthCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Output", default)]
    output: String,
}

impl ConsulService {
    fn meta(&self) -> BTreeMap<String, String> {
        self.meta
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl ConsulHealthEntry {
    fn into_instance(self) -> ServiceInstance {
        let checks = self
            .checks
            .into_iter()
            .map(|c| CheckStatus {
                check_id: c.check_id,
                name: c.name,
                status: HealthState::from_registry(&c.status),
                output: c.output,
            })
            .collect();
        // An empty service address means "use the node address".
        let address = if self.service.address.is_empty() {
            self.node.address.clone()
        } else {
            self.service.address.clone()
        };
        let meta = self.service.meta();
        let mut instance =
            ServiceInstance::new(self.service.id, self.service.service, address, self.service.port, checks);
        instance.tags = self.service.tags.unwrap_or_default();
        instance.meta = meta;
        instance
    }
}

/// Registry backend speaking the Consul agent HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulBackend {
    client: Client,
    config: ConsulConfig,
    base_url: String,
}

impl ConsulBackend {
    /// Creates a backend with a pooled HTTP client bounded by `config.timeout`.
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let base_url = config.base_url();
        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self.authorize(req).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(MeshError::Registry(format!(
            "{} failed with status {}: {}",
            what,
            status,
            body.trim()
        )))
    }
}

/// Percent-encodes a single path segment.
fn segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    #[instrument(level = "debug", skip(self, registration), fields(id = %registration.id))]
    async fn register(&self, registration: &Registration) -> Result<()> {
        let body = ConsulRegistration {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            meta: &registration.meta,
            check: registration
                .check
                .as_ref()
                .map(|def| ConsulCheck::from_definition(&registration.name, def)),
        };
        let req = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&body);
        self.send(req, "service register").await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn deregister(&self, id: &str) -> Result<bool> {
        let req = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{}", segment(id))));
        let response = self.authorize(req).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(MeshError::Registry(format!(
                "service deregister failed with status {}",
                s
            ))),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn health(&self, service: &str, passing_only: bool) -> Result<Vec<ServiceInstance>> {
        let mut req = self
            .client
            .get(self.url(&format!("/v1/health/service/{}", segment(service))));
        if passing_only {
            req = req.query(&[("passing", "true")]);
        }
        let entries: Vec<ConsulHealthEntry> = self.send(req, "health query").await?.json().await?;
        debug!(service, count = entries.len(), "health query returned");
        Ok(entries
            .into_iter()
            .map(ConsulHealthEntry::into_instance)
            .collect())
    }

    async fn agent_services(&self) -> Result<BTreeMap<String, AgentService>> {
        let req = self.client.get(self.url("/v1/agent/services"));
        let services: HashMap<String, ConsulService> =
            self.send(req, "agent services").await?.json().await?;
        Ok(services
            .into_iter()
            .map(|(id, s)| {
                let meta = s.meta();
                (
                    id,
                    AgentService {
                        id: s.id,
                        service: s.service,
                        address: s.address,
                        port: s.port,
                        tags: s.tags.unwrap_or_default(),
                        meta,
                    },
                )
            })
            .collect())
    }

    async fn leader(&self) -> Result<String> {
        let req = self.client.get(self.url("/v1/status/leader"));
        let leader: String = self.send(req, "leader lookup").await?.json().await?;
        if leader.is_empty() {
            return Err(MeshError::Registry("cluster has no leader".into()));
        }
        Ok(leader)
    }

    async fn update_check(&self, check_id: &str, status: HealthState, output: &str) -> Result<()> {
        let req = self
            .client
            .put(self.url(&format!("/v1/agent/check/update/{}", segment(check_id))))
            .json(&ConsulCheckUpdate {
                status: status.as_str(),
                output,
            });
        self.send(req, "check update").await?;
        Ok(())
    }

    async fn services(&self) -> Result<Vec<String>> {
        let req = self.client.get(self.url("/v1/catalog/services"));
        let services: BTreeMap<String, Vec<String>> =
            self.send(req, "catalog services").await?.json().await?;
        Ok(services.into_keys().filter(|name| name != "consul").collect())
    }
}
