//! Config-center boundary for cross-cutting settings.
//!
//! The mesh only reads keys and watches them; the values never become part
//! of mesh state. [`InMemoryConfigCenter`] backs tests and single-process
//! deployments.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback invoked with the key and its new value (`None` once deleted).
pub type WatchCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Handle returned by [`ConfigCenter::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

#[async_trait]
pub trait ConfigCenter: Send + Sync {
    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    /// Invokes `callback` whenever `key` changes.
    async fn watch(&self, key: &str, callback: WatchCallback) -> Result<WatchId>;

    async fn unwatch(&self, id: WatchId) -> bool;
}

/// Process-local key/value store with change notification.
#[derive(Default)]
pub struct InMemoryConfigCenter {
    values: DashMap<String, String>,
    watchers: DashMap<String, HashMap<WatchId, WatchCallback>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for InMemoryConfigCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConfigCenter")
            .field("keys", &self.values.len())
            .field("watched", &self.watchers.len())
            .finish()
    }
}

impl InMemoryConfigCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` and notifies watchers of `key` if it changed.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let previous = self.values.insert(key.to_string(), value.clone());
        if previous.as_deref() != Some(value.as_str()) {
            self.notify(key, Some(&value));
        }
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        let removed = self.values.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.notify(key, None);
        }
        removed
    }

    fn notify(&self, key: &str, value: Option<&str>) {
        // Collected first so callbacks run without holding the shard lock.
        let callbacks: Vec<WatchCallback> = self
            .watchers
            .get(key)
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default();
        debug!(key, watchers = callbacks.len(), "config changed");
        for callback in callbacks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(key, value)))
                .is_err()
            {
                warn!(key, "config watcher panicked");
            }
        }
    }
}

#[async_trait]
impl ConfigCenter for InMemoryConfigCenter {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn watch(&self, key: &str, callback: WatchCallback) -> Result<WatchId> {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.watchers
            .entry(key.to_string())
            .or_default()
            .insert(id, callback);
        Ok(id)
    }

    async fn unwatch(&self, id: WatchId) -> bool {
        let mut removed = false;
        self.watchers.retain(|_, callbacks| {
            removed |= callbacks.remove(&id).is_some();
            !callbacks.is_empty()
        });
        removed
    }
}
