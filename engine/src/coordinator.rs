//! Sync coordinator.
//!
//! [`SyncEngine`] owns the sync state and orchestrates uploads, downloads and
//! the realtime session. Uploads are single-flight: a second upload issued
//! while one runs waits in a FIFO queue and starts only after the first has
//! finished. Downloads run concurrently with everything else.

use crate::{
    config::EngineConfig,
    error::{Error, ErrorKind},
    fingerprint::{fingerprint, Fingerprint},
    local::{LocalReplica, LocalStore},
    merge::{Conflict, ConflictStrategy, Merger},
    realtime::{take_session, RealtimeFilter, RealtimeHandle, RealtimeSession, RealtimeUpdate, SessionSlot},
    remote::{RemoteReplica, RemoteStore, SnapshotSender},
    session::{AuthMonitor, AuthState, ConnectivityMonitor, Identity, UserKey},
    state::{lock, Acquire, SharedState, SyncState, UploadPermit},
    status::{ListenerHandle, StatusListeners, SyncDirection, SyncEvent, SyncStatus},
    Collection,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result of an upload or download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// Whether the operation completed
    pub success: bool,
    /// Collection uploaded, or collection now held locally after a download
    pub items: Collection,
    /// Human-readable failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Operation that produced this outcome
    pub direction: SyncDirection,
    /// Unresolved conflicts under the manual strategy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
}

impl SyncOutcome {
    fn succeeded(direction: SyncDirection, items: Collection) -> Self {
        Self {
            success: true,
            items,
            error: None,
            error_kind: None,
            direction,
            conflicts: Vec::new(),
        }
    }

    fn failed(direction: SyncDirection, items: Collection, err: &Error) -> Self {
        Self {
            success: false,
            items,
            error: Some(failure_message(err)),
            error_kind: Some(err.kind()),
            direction,
            conflicts: Vec::new(),
        }
    }

    fn conflicted(items: Collection, conflicts: Vec<Conflict>) -> Self {
        Self {
            success: false,
            items,
            error: Some(format!("Sync failed: {} unresolved conflicts", conflicts.len())),
            error_kind: None,
            direction: SyncDirection::Merge,
            conflicts,
        }
    }
}

fn failure_message(err: &Error) -> String {
    format!("Sync failed: {err}")
}

/// Snapshot of the coordinator's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub auto_sync_enabled: bool,
    /// Uploads waiting behind the running one
    pub pending_uploads: usize,
    pub last_synced_fingerprint: Option<Fingerprint>,
}

/// Remote collection as fetched, plus what should be stored locally.
struct Pulled {
    user: UserKey,
    remote: Collection,
    result: Collection,
    conflicts: Vec<Conflict>,
}

/// The sync engine.
///
/// One instance per process. All collaborators are injected at construction.
pub struct SyncEngine {
    config: EngineConfig,
    identity: Arc<dyn Identity>,
    local: LocalReplica,
    remote: RemoteReplica,
    strategy: RwLock<ConflictStrategy>,
    state: SharedState,
    listeners: StatusListeners,
    realtime: SessionSlot,
}

impl SyncEngine {
    /// Create an engine.
    pub fn new(
        config: EngineConfig,
        identity: Arc<dyn Identity>,
        local_store: Arc<dyn LocalStore>,
        remote_store: Arc<dyn RemoteStore>,
    ) -> Self {
        let local = LocalReplica::new(local_store, config.storage_prefix.clone());
        let remote = RemoteReplica::new(remote_store, config.retry.clone());
        let state = Arc::new(Mutex::new(SyncState::new(config.auto_sync)));

        Self {
            strategy: RwLock::new(config.conflict_strategy),
            config,
            identity,
            local,
            remote,
            state,
            listeners: StatusListeners::new(),
            realtime: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an engine wrapped in Arc for sharing.
    pub fn new_shared(
        config: EngineConfig,
        identity: Arc<dyn Identity>,
        local_store: Arc<dyn LocalStore>,
        remote_store: Arc<dyn RemoteStore>,
    ) -> Arc<Self> {
        Arc::new(Self::new(config, identity, local_store, remote_store))
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Key of the current user namespace.
    pub fn user_key(&self) -> UserKey {
        UserKey::resolve(self.identity.as_ref(), &self.config.anonymous_key)
    }

    /// The current user's local collection.
    pub fn load_local(&self) -> Collection {
        self.local.load(&self.user_key())
    }

    /// Replace the current user's local collection without syncing.
    pub fn save_local(&self, collection: &Collection) -> bool {
        self.local.save(&self.user_key(), collection)
    }

    /// Current conflict strategy.
    pub fn conflict_strategy(&self) -> ConflictStrategy {
        *self.strategy.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the conflict strategy used by merging downloads.
    pub fn set_conflict_strategy(&self, strategy: ConflictStrategy) {
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = strategy;
        tracing::info!(strategy = %strategy, "Conflict strategy changed");
    }

    /// Enable or disable auto sync on reconnect.
    pub fn set_auto_sync(&self, enabled: bool) {
        lock(&self.state).auto_sync_enabled = enabled;
    }

    /// Register a status listener. Dropping the handle unregisters it.
    pub fn on_sync_status_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.listeners.register(Arc::new(listener))
    }

    /// Current sync status.
    pub fn get_sync_status(&self) -> SyncStatusReport {
        let state = lock(&self.state);
        SyncStatusReport {
            is_syncing: state.in_progress,
            last_sync_time: state.last_sync_time,
            auto_sync_enabled: state.auto_sync_enabled,
            pending_uploads: state.queue.len(),
            last_synced_fingerprint: state.last_synced.clone(),
        }
    }

    fn notify(&self, status: SyncStatus, direction: SyncDirection, error: Option<String>) {
        self.listeners
            .notify(&SyncEvent::new(status, direction, error));
    }

    fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Store `items` locally and record them as the last sync, in one
    /// critical section with the realtime filter.
    fn record_synced(&self, user: &UserKey, generation: u64, items: &Collection, print: Fingerprint) {
        let mut state = lock(&self.state);
        self.local.save(user, items);
        state.mark_synced(generation, print);
    }

    /// Give up the upload permit, announcing `Idle` when nothing is queued.
    fn release_upload(&self, permit: UploadPermit) {
        if permit.release() {
            self.notify(SyncStatus::Idle, SyncDirection::Upload, None);
        }
    }

    /// Upload the collection to the remote store.
    ///
    /// Waits behind any running upload. On success the collection also
    /// becomes the local copy and its fingerprint the last synced one. The
    /// upload is bound to the user signed in when it was issued; if that
    /// session ended while it waited, it fails as unauthenticated.
    pub async fn upload_collection(&self, items: Collection) -> SyncOutcome {
        if !self.identity.is_authenticated() {
            tracing::debug!("Upload skipped, no session");
            return SyncOutcome::failed(SyncDirection::Upload, items, &Error::Unauthenticated);
        }
        let user = self.user_key();

        let permit = match self.acquire_upload().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::info!(user = %user, error = %e, "Queued upload cancelled");
                return SyncOutcome::failed(SyncDirection::Upload, items, &e);
            }
        };

        if !self.identity.is_authenticated() || self.user_key() != user {
            tracing::info!(user = %user, "Session ended while upload was queued");
            self.release_upload(permit);
            return SyncOutcome::failed(SyncDirection::Upload, items, &Error::Unauthenticated);
        }

        let generation = self.generation();
        let print = fingerprint(&items);
        self.notify(SyncStatus::Syncing, SyncDirection::Upload, None);

        let outcome = match self.remote.save(&user, &items).await {
            Ok(()) => {
                self.record_synced(&user, generation, &items, print.clone());
                tracing::info!(user = %user, items = items.len(), fingerprint = %print, "Upload complete");
                self.notify(SyncStatus::Success, SyncDirection::Upload, None);
                SyncOutcome::succeeded(SyncDirection::Upload, items)
            }
            Err(e) => {
                tracing::error!(user = %user, error = %e, "Upload failed");
                self.notify(
                    SyncStatus::Error,
                    SyncDirection::Upload,
                    Some(failure_message(&e)),
                );
                SyncOutcome::failed(SyncDirection::Upload, items, &e)
            }
        };

        self.release_upload(permit);
        outcome
    }

    async fn acquire_upload(&self) -> Result<UploadPermit, Error> {
        let rx = match UploadPermit::acquire(&self.state) {
            Acquire::Ready(permit) => return Ok(permit),
            Acquire::Queued(rx) => rx,
        };

        let permit = rx.await.map_err(|_| Error::Cancelled)?;
        if !self.config.queue_drain_delay.is_zero() {
            tokio::time::sleep(self.config.queue_drain_delay).await;
        }
        Ok(permit)
    }

    /// Download the remote collection into the local replica.
    ///
    /// With `merge_with_local`, a non-empty local collection is merged with
    /// the remote one under the current conflict strategy. Unresolved manual
    /// conflicts fail the download and leave the local copy untouched.
    pub async fn download_collection(&self, merge_with_local: bool) -> SyncOutcome {
        let direction = if merge_with_local {
            SyncDirection::Merge
        } else {
            SyncDirection::Download
        };

        if !self.identity.is_authenticated() {
            tracing::debug!("Download skipped, no session");
            return SyncOutcome::failed(direction, Collection::new(), &Error::Unauthenticated);
        }

        match self.pull(direction, merge_with_local).await {
            Ok(pulled) => self.finish_pull(direction, pulled).0,
            Err(outcome) => outcome,
        }
    }

    async fn pull(&self, direction: SyncDirection, merge_with_local: bool) -> Result<Pulled, SyncOutcome> {
        let user = self.user_key();
        self.notify(SyncStatus::Syncing, direction, None);

        let remote = match self.remote.fetch(&user).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "Download failed");
                self.notify(SyncStatus::Error, direction, Some(failure_message(&e)));
                return Err(SyncOutcome::failed(direction, Collection::new(), &e));
            }
        };

        let local = if merge_with_local {
            self.local.load(&user)
        } else {
            Collection::new()
        };
        if local.is_empty() {
            return Ok(Pulled {
                user,
                result: remote.clone(),
                remote,
                conflicts: Vec::new(),
            });
        }

        let outcome = Merger::new(self.conflict_strategy())
            .with_line_items_field(self.config.line_items_field.clone())
            .merge(&local, &remote);
        tracing::debug!(
            user = %user,
            local = local.len(),
            remote = remote.len(),
            merged = outcome.collection.len(),
            conflicts = outcome.conflicts.len(),
            "Merged local and remote collections"
        );

        Ok(Pulled {
            user,
            remote,
            result: outcome.collection,
            conflicts: outcome.conflicts,
        })
    }

    /// Persist a pulled collection. Returns the outcome and whether the
    /// stored result differs from the remote collection.
    fn finish_pull(&self, direction: SyncDirection, pulled: Pulled) -> (SyncOutcome, bool) {
        let Pulled {
            user,
            remote,
            result,
            conflicts,
        } = pulled;

        if !conflicts.is_empty() {
            let outcome = SyncOutcome::conflicted(result, conflicts);
            tracing::warn!(conflicts = outcome.conflicts.len(), "Download left unresolved conflicts");
            self.notify(SyncStatus::Error, direction, outcome.error.clone());
            return (outcome, false);
        }

        let generation = self.generation();
        let print = fingerprint(&result);
        let diverged = print != fingerprint(&remote);

        self.record_synced(&user, generation, &result, print.clone());
        tracing::info!(user = %user, items = result.len(), fingerprint = %print, "Download complete");
        self.notify(SyncStatus::Success, direction, None);

        (SyncOutcome::succeeded(direction, result), diverged)
    }

    /// Download with merge, then upload the merged collection if it differs
    /// from what the remote store holds.
    pub async fn sync_now(&self) -> SyncOutcome {
        if !self.identity.is_authenticated() {
            return SyncOutcome::failed(SyncDirection::Merge, Collection::new(), &Error::Unauthenticated);
        }

        let pulled = match self.pull(SyncDirection::Merge, true).await {
            Ok(pulled) => pulled,
            Err(outcome) => return outcome,
        };
        let (outcome, diverged) = self.finish_pull(SyncDirection::Merge, pulled);
        if !outcome.success || !diverged {
            return outcome;
        }

        tracing::debug!("Merged collection differs from remote, uploading");
        self.upload_collection(outcome.items).await
    }

    /// Subscribe to remote changes of the current user's collection.
    ///
    /// Genuine external changes are stored locally and passed to `on_update`.
    /// Replaces any running session. Returns `None` when nobody is signed in,
    /// when no Tokio runtime is available or when the subscription fails.
    pub fn start_realtime_sync<F>(&self, on_update: F) -> Option<RealtimeHandle>
    where
        F: Fn(RealtimeUpdate) + Send + Sync + 'static,
    {
        if !self.identity.is_authenticated() {
            tracing::debug!("Realtime sync not started, no session");
            return None;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "Realtime sync requires a Tokio runtime");
                return None;
            }
        };

        self.stop_realtime_sync();

        let user = self.user_key();
        let filter = RealtimeFilter::new(
            Arc::clone(&self.state),
            self.local.clone(),
            user.clone(),
            Arc::new(on_update),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let gate = filter.clone();
        let sender = SnapshotSender::gated(tx, move || gate.accepts_delivery());
        let subscription = match self.remote.subscribe(&user, sender) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Realtime subscription failed");
                return None;
            }
        };

        let task = runtime.spawn(filter.pump(rx));
        let session = RealtimeSession::new(user.clone(), subscription, task);
        let id = session.id();

        let replaced = self
            .realtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session);
        drop(replaced);

        tracing::info!(session = %id, user = %user, "Realtime sync started");
        Some(RealtimeHandle::new(id, Arc::clone(&self.realtime)))
    }

    /// Stop the realtime session, if one is running.
    pub fn stop_realtime_sync(&self) {
        drop(take_session(&self.realtime, None));
    }

    /// Whether a realtime session is running.
    pub fn is_realtime_active(&self) -> bool {
        self.realtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Forget sync history, cancel queued uploads and stop realtime sync.
    ///
    /// An upload already talking to the remote store runs to completion but
    /// no longer records itself as the last sync.
    pub fn clear_sync_state(&self) {
        let cancelled = lock(&self.state).reset();
        let cancelled_uploads = cancelled.len();
        drop(cancelled);

        self.stop_realtime_sync();
        tracing::info!(cancelled_uploads, "Sync state cleared");
    }

    /// Clear sync state whenever the session signs out.
    pub fn watch_session(self: &Arc<Self>, monitor: &AuthMonitor) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let mut rx = monitor.subscribe();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let signed_out = *rx.borrow_and_update() == AuthState::SignedOut;
                if !signed_out {
                    continue;
                }
                let Some(engine) = Weak::upgrade(&engine) else {
                    break;
                };
                engine.clear_sync_state();
            }
        })
    }

    /// Run [`sync_now`](Self::sync_now) whenever connectivity comes back and
    /// auto sync is enabled.
    pub fn watch_connectivity(self: &Arc<Self>, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let mut rx = monitor.subscribe();
        let mut connected = rx.borrow_and_update().is_connected();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let now_connected = rx.borrow_and_update().is_connected();
                let reconnected = now_connected && !connected;
                connected = now_connected;
                if !reconnected {
                    continue;
                }

                let Some(engine) = Weak::upgrade(&engine) else {
                    break;
                };
                if !lock(&engine.state).auto_sync_enabled {
                    continue;
                }
                tracing::info!("Connection restored, syncing");
                let outcome = engine.sync_now().await;
                if !outcome.success {
                    tracing::warn!(error = ?outcome.error, "Sync after reconnect failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("strategy", &self.conflict_strategy())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}
