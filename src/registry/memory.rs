//! In-process registry backend.
//!
//! Keeps registrations in a [`DashMap`] and evaluates checks from their last
//! pushed status. HTTP checks are never executed; they start passing and can be
//! flipped with [`InMemoryRegistry::set_instance_health`].

use super::model::{
    AgentService, CheckDefinition, CheckStatus, HealthState, Registration, ServiceInstance,
};
use super::RegistryBackend;
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
struct Entry {
    registration: Registration,
    checks: BTreeMap<String, CheckStatus>,
}

/// Registry backend held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: DashMap<String, Entry>,
    unavailable: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the store going away; every call fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Forces every check of an instance to `status`.
    ///
    /// Instances registered without a check get a synthetic one so they can
    /// still be marked failing. Returns `false` for an unknown id.
    pub fn set_instance_health(&self, instance_id: &str, status: HealthState) -> bool {
        let Some(mut entry) = self.entries.get_mut(instance_id) else {
            return false;
        };
        if entry.checks.is_empty() {
            let check_id = super::model::service_check_id(instance_id);
            entry.checks.insert(
                check_id.clone(),
                CheckStatus {
                    check_id,
                    name: "synthetic".into(),
                    status,
                    output: String::new(),
                },
            );
        }
        for check in entry.checks.values_mut() {
            check.status = status;
        }
        true
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MeshError::Registry("registry unavailable".into()));
        }
        Ok(())
    }
}

fn initial_checks(registration: &Registration) -> BTreeMap<String, CheckStatus> {
    let mut checks = BTreeMap::new();
    if let Some(def) = &registration.check {
        let status = match def {
            CheckDefinition::Http { .. } => HealthState::Passing,
            CheckDefinition::Ttl { .. } => HealthState::Critical,
        };
        checks.insert(
            def.check_id().to_string(),
            CheckStatus {
                check_id: def.check_id().to_string(),
                name: format!("{} health check", registration.name),
                status,
                output: String::new(),
            },
        );
    }
    checks
}

#[async_trait]
impl RegistryBackend for InMemoryRegistry {
    async fn register(&self, registration: &Registration) -> Result<()> {
        self.ensure_available()?;
        let checks = initial_checks(registration);
        self.entries.insert(
            registration.id.clone(),
            Entry {
                registration: registration.clone(),
                checks,
            },
        );
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.entries.remove(id).is_some())
    }

    async fn health(&self, service: &str, passing_only: bool) -> Result<Vec<ServiceInstance>> {
        self.ensure_available()?;
        let mut instances: Vec<ServiceInstance> = self
            .entries
            .iter()
            .filter(|e| e.registration.name == service)
            .map(|e| {
                let reg = &e.registration;
                let mut instance = ServiceInstance::new(
                    reg.id.clone(),
                    reg.name.clone(),
                    reg.address.clone(),
                    reg.port,
                    e.checks.values().cloned().collect(),
                );
                instance.tags = reg.tags.clone();
                instance.meta = reg.meta.clone();
                instance
            })
            .filter(|i| !passing_only || i.passing)
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn agent_services(&self) -> Result<BTreeMap<String, AgentService>> {
        self.ensure_available()?;
        Ok(self
            .entries
            .iter()
            .map(|e| {
                let reg = &e.registration;
                (
                    reg.id.clone(),
                    AgentService {
                        id: reg.id.clone(),
                        service: reg.name.clone(),
                        address: reg.address.clone(),
                        port: reg.port,
                        tags: reg.tags.clone(),
                        meta: reg.meta.clone(),
                    },
                )
            })
            .collect())
    }

    async fn leader(&self) -> Result<String> {
        self.ensure_available()?;
        Ok("in-memory".to_string())
    }

    async fn update_check(&self, check_id: &str, status: HealthState, output: &str) -> Result<()> {
        self.ensure_available()?;
        for mut entry in self.entries.iter_mut() {
            if let Some(check) = entry.checks.get_mut(check_id) {
                check.status = status;
                check.output = output.to_string();
                return Ok(());
            }
        }
        Err(MeshError::NotFound {
            kind: "check",
            name: check_id.to_string(),
        })
    }

    async fn services(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        let names: BTreeSet<String> = self
            .entries
            .iter()
            .map(|e| e.registration.name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str, name: &str, check: Option<CheckDefinition>) -> Registration {
        Registration {
            id: id.into(),
            name: name.into(),
            address: "127.0.0.1".into(),
            port: 9000,
            tags: vec![],
            meta: BTreeMap::new(),
            check,
        }
    }

    #[tokio::test]
    async fn test_ttl_check_starts_critical() {
        let registry = InMemoryRegistry::new();
        let check = CheckDefinition::Ttl {
            check_id: "service:a-1".into(),
            ttl: "30s".into(),
        };
        registry
            .register(&registration("a-1", "a", Some(check)))
            .await
            .unwrap();

        assert!(registry.health("a", true).await.unwrap().is_empty());
        registry
            .update_check("service:a-1", HealthState::Passing, "ok")
            .await
            .unwrap();
        assert_eq!(registry.health("a", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let registry = InMemoryRegistry::new();
        registry.set_available(false);
        assert!(registry.leader().await.is_err());
        registry.set_available(true);
        assert_eq!(registry.leader().await.unwrap(), "in-memory");
    }

    #[tokio::test]
    async fn test_services_are_unique_and_sorted() {
        let registry = InMemoryRegistry::new();
        registry.register(&registration("b-1", "b", None)).await.unwrap();
        registry.register(&registration("a-1", "a", None)).await.unwrap();
        registry.register(&registration("a-2", "a", None)).await.unwrap();

        assert_eq!(registry.services().await.unwrap(), vec!["a", "b"]);
        assert!(registry.deregister("a-2").await.unwrap());
        assert!(!registry.deregister("a-2").await.unwrap());
    }
}
