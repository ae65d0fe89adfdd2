//! Mesh lifecycle events and the publish/subscribe bus that delivers them.
//!
//! Handlers are keyed by [`MeshEventType`] and run synchronously on the
//! emitting task, in subscription order. A panicking handler is logged and
//! skipped; the remaining handlers still run.

use crate::mesh::{MeshService, MeshServiceStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Discriminant of a [`MeshEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshEventType {
    ServiceRegistered,
    ServiceDeregistered,
    ServiceHealthChanged,
    ConfigUpdated,
    ProxyConfigUpdated,
    MeshStatusChanged,
}

impl MeshEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshEventType::ServiceRegistered => "service_registered",
            MeshEventType::ServiceDeregistered => "service_deregistered",
            MeshEventType::ServiceHealthChanged => "service_health_changed",
            MeshEventType::ConfigUpdated => "config_updated",
            MeshEventType::ProxyConfigUpdated => "proxy_config_updated",
            MeshEventType::MeshStatusChanged => "mesh_status_changed",
        }
    }
}

impl fmt::Display for MeshEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mesh lifecycle event with its typed payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    ServiceRegistered {
        service: MeshService,
    },
    ServiceDeregistered {
        name: String,
        timestamp: DateTime<Utc>,
    },
    ServiceHealthChanged {
        service_name: String,
        old_status: MeshServiceStatus,
        new_status: MeshServiceStatus,
        healthy_count: usize,
        total_count: usize,
        timestamp: DateTime<Utc>,
    },
    ConfigUpdated {
        key: String,
        value: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ProxyConfigUpdated {
        service_name: String,
        path: PathBuf,
        timestamp: DateTime<Utc>,
    },
    MeshStatusChanged {
        status: String,
        timestamp: DateTime<Utc>,
    },
}

impl MeshEvent {
    pub fn event_type(&self) -> MeshEventType {
        match self {
            MeshEvent::ServiceRegistered { .. } => MeshEventType::ServiceRegistered,
            MeshEvent::ServiceDeregistered { .. } => MeshEventType::ServiceDeregistered,
            MeshEvent::ServiceHealthChanged { .. } => MeshEventType::ServiceHealthChanged,
            MeshEvent::ConfigUpdated { .. } => MeshEventType::ConfigUpdated,
            MeshEvent::ProxyConfigUpdated { .. } => MeshEventType::ProxyConfigUpdated,
            MeshEvent::MeshStatusChanged { .. } => MeshEventType::MeshStatusChanged,
        }
    }

    pub fn mesh_status(status: impl Into<String>) -> Self {
        MeshEvent::MeshStatusChanged {
            status: status.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

/// Synchronous publish/subscribe registry keyed by event type.
pub struct EventBus {
    handlers: RwLock<HashMap<MeshEventType, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<MeshEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(256);
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stream,
        }
    }

    /// Registers `handler` for events of `event_type`.
    pub fn on<F>(&self, event_type: MeshEventType, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(event = %event_type, "event handler registered");
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Delivers `event` to every handler of its type.
    ///
    /// Handlers are cloned out of the lock first so a handler may subscribe
    /// or unsubscribe without deadlocking.
    pub fn emit(&self, event: MeshEvent) {
        let event_type = event.event_type();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&event_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(event = %event_type, "event handler panicked");
            }
        }

        let _ = self.stream.send(event);
    }

    /// Async stream of every event, for consumers that prefer a channel.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.stream.subscribe()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}
