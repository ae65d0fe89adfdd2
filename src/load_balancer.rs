//! Instance selection strategies.
//!
//! Selection is a pure function of the instance list plus, for round-robin,
//! one cursor per service. Cursors live in a [`DashMap`] so different services
//! never contend.

use crate::registry::ServiceInstance;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerStrategy {
    /// Cycle through instances in list order.
    #[default]
    RoundRobin,
    /// Uniform random choice.
    Random,
    /// Fewest `connections` advertised in instance metadata.
    LeastConnections,
    /// Hash-ring lookup on a request key.
    ConsistentHash,
}

impl LoadBalancerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::RoundRobin => "round-robin",
            LoadBalancerStrategy::Random => "random",
            LoadBalancerStrategy::LeastConnections => "least-connections",
            LoadBalancerStrategy::ConsistentHash => "consistent-hash",
        }
    }

    /// Parses a strategy name, falling back to round-robin with a warning.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(strategy = name, "unknown load balancing strategy, using round-robin");
            LoadBalancerStrategy::RoundRobin
        })
    }
}

impl fmt::Display for LoadBalancerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancerStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" => Ok(LoadBalancerStrategy::RoundRobin),
            "random" => Ok(LoadBalancerStrategy::Random),
            "least-connections" | "leastconnections" => Ok(LoadBalancerStrategy::LeastConnections),
            "consistent-hash" | "consistenthash" => Ok(LoadBalancerStrategy::ConsistentHash),
            other => Err(format!("unknown load balancing strategy: {}", other)),
        }
    }
}

/// 31-multiplier string hash over UTF-16 code units, folded to a non-negative value.
pub fn string_hash(input: &str) -> u32 {
    let hash = input
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32));
    hash.unsigned_abs()
}

/// Per-service instance selector.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursors: DashMap<String, usize>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks one instance. Returns `None` only when `instances` is empty.
    ///
    /// `hash_key` is consulted by consistent-hash; without one that strategy
    /// degrades to random.
    pub fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
        service: &str,
        strategy: LoadBalancerStrategy,
        hash_key: Option<&str>,
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let chosen = match strategy {
            LoadBalancerStrategy::RoundRobin => self.round_robin(instances, service),
            LoadBalancerStrategy::Random => instances.choose(&mut rand::thread_rng()),
            LoadBalancerStrategy::LeastConnections => least_connections(instances),
            LoadBalancerStrategy::ConsistentHash => match hash_key {
                Some(key) => consistent_hash(instances, key),
                None => instances.choose(&mut rand::thread_rng()),
            },
        };

        if let Some(instance) = chosen {
            debug!(service, strategy = %strategy, instance = %instance.id, "selected instance");
        }
        chosen
    }

    /// Clears the round-robin cursor of `service`.
    pub fn reset(&self, service: &str) {
        self.cursors.remove(service);
    }

    fn round_robin<'a>(
        &self,
        instances: &'a [ServiceInstance],
        service: &str,
    ) -> Option<&'a ServiceInstance> {
        let len = instances.len();
        let mut cursor = self.cursors.entry(service.to_string()).or_insert(0);
        let current = *cursor % len;
        *cursor = (current + 1) % len;
        instances.get(current)
    }
}

fn least_connections(instances: &[ServiceInstance]) -> Option<&ServiceInstance> {
    let min = instances.iter().map(ServiceInstance::connections).min()?;
    let tied: Vec<&ServiceInstance> = instances
        .iter()
        .filter(|i| i.connections() == min)
        .collect();
    tied.choose(&mut rand::thread_rng()).copied()
}

fn consistent_hash<'a>(instances: &'a [ServiceInstance], key: &str) -> Option<&'a ServiceInstance> {
    let key_hash = string_hash(key);
    let mut ring: Vec<(u32, &ServiceInstance)> = instances
        .iter()
        .map(|i| (string_hash(&i.id), i))
        .collect();
    ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

    ring.iter()
        .find(|(h, _)| *h >= key_hash)
        .or_else(|| ring.first())
        .map(|(_, i)| *i)
}
