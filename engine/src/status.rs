//! Sync status notifications.
//!
//! Listeners are kept in a registry and notified one by one. A listener that
//! panics is logged and skipped; the remaining listeners still run.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Coordinator state reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// The last upload finished and none is queued.
    Idle,
    /// A sync started.
    Syncing,
    /// The last sync completed.
    Success,
    /// The last sync failed.
    Error,
}

/// Which way data moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Local collection written to the remote store.
    Upload,
    /// Remote collection written to the local replica as-is.
    Download,
    /// Remote collection merged with the local one.
    Merge,
}

/// A status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    /// New status
    pub status: SyncStatus,
    /// Operation that caused the change
    pub direction: SyncDirection,
    /// Failure detail for `Error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the change happened
    pub at: DateTime<Utc>,
}

impl SyncEvent {
    /// Create an event stamped with the current time.
    pub fn new(status: SyncStatus, direction: SyncDirection, error: Option<String>) -> Self {
        Self {
            status,
            direction,
            error,
            at: Utc::now(),
        }
    }
}

/// A status listener.
pub type StatusListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

type Registry = DashMap<String, StatusListener>;

/// Registry of status listeners.
#[derive(Default)]
pub struct StatusListeners {
    listeners: Arc<Registry>,
}

impl StatusListeners {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned handle unregisters it.
    pub fn register(&self, listener: StatusListener) -> ListenerHandle {
        let id = uuid::Uuid::new_v4().to_string();
        self.listeners.insert(id.clone(), listener);
        tracing::debug!(listener = %id, "Status listener registered");

        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Notify every listener.
    ///
    /// Returns the number of listeners that returned normally.
    pub fn notify(&self, event: &SyncEvent) -> usize {
        // Snapshot first so a listener may (un)register without deadlocking
        // the shard it lives in.
        let listeners: Vec<(String, StatusListener)> = self
            .listeners
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(listener = %id, status = ?event.status, "Status listener panicked");
                }
            }
        }
        delivered
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for StatusListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}

/// Registration of a status listener. Dropping it unregisters the listener.
#[must_use = "dropping a ListenerHandle unregisters the listener"]
#[derive(Debug)]
pub struct ListenerHandle {
    id: String,
    registry: Weak<Registry>,
}

impl ListenerHandle {
    /// Unregister the listener now.
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.id).is_some() {
                tracing::debug!(listener = %self.id, "Status listener unregistered");
            }
        }
    }
}
