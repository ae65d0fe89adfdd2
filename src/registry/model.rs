//! Registry data model: descriptors submitted at registration, instances
//! returned by discovery, and the backend-neutral registration payload.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::warn;

/// Metadata keys used to carry descriptor fields through the registry.
pub(crate) const META_VERSION: &str = "mesh-version";
pub(crate) const META_HTTP_PORT: &str = "mesh-http-port";
pub(crate) const META_TCP_PORT: &str = "mesh-tcp-port";
pub(crate) const META_DEPENDENCIES: &str = "mesh-dependencies";
pub(crate) const META_HEALTH_PATH: &str = "mesh-health-path";

/// Interval used when a duration string cannot be parsed.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Parses a `"<n><unit>"` duration string (units `s`, `m`, `h`).
///
/// Anything else falls back to [`DEFAULT_CHECK_INTERVAL`] with a warning.
pub fn parse_interval(input: &str) -> Duration {
    let trimmed = input.trim();
    let parsed = trimmed
        .char_indices()
        .last()
        .and_then(|(idx, unit)| {
            let digits = &trimmed[..idx];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let n: u64 = digits.parse().ok()?;
            let secs = match unit {
                's' => n,
                'm' => n.checked_mul(60)?,
                'h' => n.checked_mul(3600)?,
                _ => return None,
            };
            Some(Duration::from_secs(secs))
        });

    match parsed {
        Some(d) if !d.is_zero() => d,
        _ => {
            warn!(
                interval = input,
                "invalid interval, falling back to {}s",
                DEFAULT_CHECK_INTERVAL.as_secs()
            );
            DEFAULT_CHECK_INTERVAL
        }
    }
}

/// Health-check declaration carried by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheckSpec {
    /// Local command run by the registering process; exit status 0 means passing.
    Script {
        command: String,
        #[serde(default = "default_interval")]
        interval: String,
        #[serde(default)]
        timeout: Option<String>,
    },
    /// HTTP check executed by the registry itself.
    Http {
        url: String,
        #[serde(default = "default_interval")]
        interval: String,
        #[serde(default)]
        timeout: Option<String>,
    },
    /// Time-to-live check fed externally through `update_health_check`.
    Ttl { ttl: String },
}

fn default_interval() -> String {
    "10s".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

/// Registration-time definition of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub tcp_port: Option<u16>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ServiceDescriptor {
    /// Creates a descriptor bound to the loopback address with no ports.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            version: version.into(),
            address: default_address(),
            http_port: None,
            tcp_port: None,
            tags: BTreeSet::new(),
            meta: BTreeMap::new(),
            health_check_path: None,
            health_check: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = Some(path.into());
        self
    }

    pub fn with_health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Port announced to the registry: HTTP when present, else TCP.
    pub fn primary_port(&self) -> Option<u16> {
        self.http_port.or(self.tcp_port)
    }

    /// Health-check path, defaulting to `/health`.
    pub fn health_path(&self) -> &str {
        self.health_check_path.as_deref().unwrap_or("/health")
    }

    /// Checks the fields the registry needs: a name and at least one port.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::Validation("service name is required".into()));
        }
        if self.primary_port().is_none() {
            return Err(MeshError::Validation(format!(
                "service {} requires http_port or tcp_port",
                self.name
            )));
        }
        if self.address.trim().is_empty() {
            return Err(MeshError::Validation(format!(
                "service {} has an empty address",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns a copy with `id` filled in (`<name>-<unix millis>` when absent).
    pub fn with_resolved_id(mut self) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(format!(
                "{}-{}",
                self.name,
                chrono::Utc::now().timestamp_millis()
            ));
        }
        self
    }

    /// Instance id, if already resolved.
    pub fn instance_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Metadata as stored in the registry, including the mesh-owned keys.
    pub(crate) fn registry_meta(&self) -> BTreeMap<String, String> {
        let mut meta = self.meta.clone();
        if !self.version.is_empty() {
            meta.insert(META_VERSION.into(), self.version.clone());
        }
        if let Some(port) = self.http_port {
            meta.insert(META_HTTP_PORT.into(), port.to_string());
        }
        if let Some(port) = self.tcp_port {
            meta.insert(META_TCP_PORT.into(), port.to_string());
        }
        if !self.dependencies.is_empty() {
            meta.insert(META_DEPENDENCIES.into(), self.dependencies.join(","));
        }
        if let Some(path) = &self.health_check_path {
            meta.insert(META_HEALTH_PATH.into(), path.clone());
        }
        meta
    }

    /// Rebuilds a descriptor from what the registry stored for an instance.
    pub fn from_agent_service(service: &AgentService) -> Self {
        let mut meta = service.meta.clone();
        let version = meta.remove(META_VERSION).unwrap_or_default();
        let http_port = meta.remove(META_HTTP_PORT).and_then(|p| p.parse().ok());
        let tcp_port = meta.remove(META_TCP_PORT).and_then(|p| p.parse().ok());
        let dependencies = meta
            .remove(META_DEPENDENCIES)
            .map(|deps| {
                deps.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let health_check_path = meta.remove(META_HEALTH_PATH);

        Self {
            name: service.service.clone(),
            id: Some(service.id.clone()),
            version,
            address: service.address.clone(),
            // Older registrations carry only the announced port.
            http_port: if http_port.is_none() && tcp_port.is_none() {
                Some(service.port)
            } else {
                http_port
            },
            tcp_port,
            tags: service.tags.iter().cloned().collect(),
            meta,
            health_check_path,
            health_check: None,
            dependencies,
        }
    }
}

/// Status of a single registry health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Passing,
    Warning,
    Critical,
}

impl HealthState {
    /// Parses a registry status string; unknown values count as critical.
    pub fn from_registry(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "passing" => HealthState::Passing,
            "warning" => HealthState::Warning,
            _ => HealthState::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Passing => "passing",
            HealthState::Warning => "warning",
            HealthState::Critical => "critical",
        }
    }
}

/// One health check attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub check_id: String,
    pub name: String,
    pub status: HealthState,
    #[serde(default)]
    pub output: String,
}

/// A live, discovered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: Vec<CheckStatus>,
    /// True when every check attached to the instance is passing.
    pub passing: bool,
}

impl ServiceInstance {
    /// Derives `passing` from the attached checks.
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        checks: Vec<CheckStatus>,
    ) -> Self {
        let passing = checks.iter().all(|c| c.status == HealthState::Passing);
        Self {
            id: id.into(),
            service: service.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
            meta: BTreeMap::new(),
            checks,
            passing,
        }
    }

    /// Active connection count advertised in metadata, used by least-connections.
    pub fn connections(&self) -> u64 {
        self.meta
            .get("connections")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0)
    }

    /// Base URL of the instance with `path` appended.
    ///
    /// Uses `https` when `meta.secure == "true"`.
    pub fn url(&self, path: &str) -> String {
        let scheme = if self.meta.get("secure").map(String::as_str) == Some("true") {
            "https"
        } else {
            "http"
        };
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}://{}:{}{}", scheme, self.address, self.port, path)
    }
}

/// Aggregated health of one instance as reported by `get_service_health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub health_status: HealthState,
    pub checks: Vec<CheckStatus>,
}

impl InstanceHealth {
    pub(crate) fn from_instance(instance: &ServiceInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            health_status: if instance.passing {
                HealthState::Passing
            } else {
                HealthState::Critical
            },
            checks: instance.checks.clone(),
        }
    }
}

/// Check definition sent with a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDefinition {
    Http {
        check_id: String,
        url: String,
        interval: String,
        timeout: Option<String>,
    },
    Ttl {
        check_id: String,
        ttl: String,
    },
}

impl CheckDefinition {
    pub fn check_id(&self) -> &str {
        match self {
            CheckDefinition::Http { check_id, .. } | CheckDefinition::Ttl { check_id, .. } => {
                check_id
            }
        }
    }
}

/// Backend-neutral registration payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub check: Option<CheckDefinition>,
}

/// Check id the registry assigns to an instance's service-level check.
pub fn service_check_id(instance_id: &str) -> String {
    format!("service:{}", instance_id)
}

impl Registration {
    /// Builds the payload for a descriptor whose id is already resolved.
    ///
    /// Script checks become TTL checks (three intervals) fed by the local poller.
    pub fn from_descriptor(descriptor: &ServiceDescriptor, id: &str) -> Result<Self> {
        let port = descriptor.primary_port().ok_or_else(|| {
            MeshError::Validation(format!("service {} has no port", descriptor.name))
        })?;
        let check_id = service_check_id(id);

        let check = match &descriptor.health_check {
            Some(HealthCheckSpec::Script { interval, .. }) => {
                let ttl = parse_interval(interval).as_secs().saturating_mul(3);
                Some(CheckDefinition::Ttl {
                    check_id,
                    ttl: format!("{}s", ttl),
                })
            }
            Some(HealthCheckSpec::Http {
                url,
                interval,
                timeout,
            }) => Some(CheckDefinition::Http {
                check_id,
                url: url.clone(),
                interval: interval.clone(),
                timeout: timeout.clone(),
            }),
            Some(HealthCheckSpec::Ttl { ttl }) => Some(CheckDefinition::Ttl {
                check_id,
                ttl: ttl.clone(),
            }),
            None => descriptor.http_port.and_then(|http_port| {
                descriptor
                    .health_check_path
                    .as_ref()
                    .map(|path| CheckDefinition::Http {
                        check_id,
                        url: format!("http://{}:{}{}", descriptor.address, http_port, path),
                        interval: default_interval(),
                        timeout: Some("5s".into()),
                    })
            }),
        };

        Ok(Self {
            id: id.to_string(),
            name: descriptor.name.clone(),
            address: descriptor.address.clone(),
            port,
            tags: descriptor.tags.iter().cloned().collect(),
            meta: descriptor.registry_meta(),
            check,
        })
    }
}

/// Registry-side view of a registered instance (agent service table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentService {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
}
