//! Realtime filter for remote snapshots.
//!
//! The subscription observes the same document the engine writes to, so it
//! also delivers the engine's own writes. A snapshot is forwarded only if it
//! is a genuine external change:
//!
//! 1. while an upload holds the permit, every snapshot is dropped;
//! 2. a snapshot whose fingerprint equals the last synced one is an echo;
//! 3. anything else is persisted locally, recorded as synced and forwarded.
//!
//! Rule 1 is applied twice: when the store delivers the snapshot, so an echo
//! of an upload that later fails never reaches the queue, and again when the
//! pump task handles it. Steps 1 to 3 up to the fingerprint update happen in
//! one critical section with the coordinator's own state flips.

use crate::{
    fingerprint::fingerprint,
    local::LocalReplica,
    remote::{SnapshotEvent, SnapshotMetadata, Subscription},
    session::UserKey,
    state::{lock, SharedState},
    Collection,
};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A genuine remote change, as delivered to the update callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeUpdate {
    pub items: Collection,
    pub from_cache: bool,
    pub has_pending_writes: bool,
}

/// Callback receiving genuine remote changes.
pub type UpdateCallback = Arc<dyn Fn(RealtimeUpdate) + Send + Sync>;

/// What the filter did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dropped because an upload was running.
    InFlight,
    /// Dropped because it matched the last synced collection.
    Echo,
    /// Forwarded as an external change.
    Accepted,
}

/// Applies the filtering rules to incoming snapshots.
#[derive(Clone)]
pub(crate) struct RealtimeFilter {
    state: SharedState,
    local: LocalReplica,
    user: UserKey,
    on_update: UpdateCallback,
}

impl RealtimeFilter {
    pub fn new(
        state: SharedState,
        local: LocalReplica,
        user: UserKey,
        on_update: UpdateCallback,
    ) -> Self {
        Self {
            state,
            local,
            user,
            on_update,
        }
    }

    /// Delivery-time check: whether the store may queue a snapshot now.
    pub fn accepts_delivery(&self) -> bool {
        let in_flight = lock(&self.state).in_progress;
        if in_flight {
            tracing::debug!(user = %self.user, "Snapshot refused at delivery, upload in flight");
        }
        !in_flight
    }

    pub fn handle(&self, items: Collection, metadata: SnapshotMetadata) -> Admission {
        let print = fingerprint(&items);
        {
            let mut state = lock(&self.state);
            if state.in_progress {
                tracing::debug!(user = %self.user, "Snapshot dropped, upload in flight");
                return Admission::InFlight;
            }
            if state.last_synced.as_ref() == Some(&print) {
                tracing::debug!(user = %self.user, fingerprint = %print, "Snapshot dropped as echo");
                return Admission::Echo;
            }
            self.local.save(&self.user, &items);
            let generation = state.generation;
            state.mark_synced(generation, print.clone());
        }

        tracing::info!(
            user = %self.user,
            items = items.len(),
            fingerprint = %print,
            from_cache = metadata.from_cache,
            "Remote change received"
        );

        let update = RealtimeUpdate {
            items,
            from_cache: metadata.from_cache,
            has_pending_writes: metadata.has_pending_writes,
        };
        if catch_unwind(AssertUnwindSafe(|| (self.on_update)(update))).is_err() {
            tracing::error!(user = %self.user, "Realtime update callback panicked");
        }
        Admission::Accepted
    }

    /// Drain the subscription channel until it closes.
    pub async fn pump(self, mut rx: mpsc::UnboundedReceiver<SnapshotEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                Ok(snapshot) => {
                    self.handle(snapshot.collection, snapshot.metadata);
                }
                Err(e) => {
                    tracing::warn!(user = %self.user, error = %e, "Realtime subscription error");
                }
            }
        }
        tracing::debug!(user = %self.user, "Realtime channel closed");
    }
}

/// A running realtime session: the remote subscription plus its pump task.
#[derive(Debug)]
pub(crate) struct RealtimeSession {
    id: uuid::Uuid,
    user: UserKey,
    _subscription: Subscription,
    task: JoinHandle<()>,
}

impl RealtimeSession {
    pub fn new(user: UserKey, subscription: Subscription, task: JoinHandle<()>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            user,
            _subscription: subscription,
            task,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.task.abort();
        tracing::info!(session = %self.id, user = %self.user, "Realtime sync stopped");
    }
}

/// Slot holding the engine's active realtime session, if any.
pub(crate) type SessionSlot = Arc<Mutex<Option<RealtimeSession>>>;

/// Take the session out of the slot. The caller drops it outside the lock.
pub(crate) fn take_session(slot: &SessionSlot, only: Option<uuid::Uuid>) -> Option<RealtimeSession> {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match (only, guard.as_ref()) {
        (Some(id), Some(session)) if session.id() != id => None,
        _ => guard.take(),
    }
}

/// Handle to a realtime session started by
/// [`SyncEngine::start_realtime_sync`](crate::SyncEngine::start_realtime_sync).
///
/// Dropping the handle leaves the session running; call
/// [`stop`](Self::stop) or
/// [`SyncEngine::stop_realtime_sync`](crate::SyncEngine::stop_realtime_sync).
#[derive(Debug, Clone)]
pub struct RealtimeHandle {
    id: uuid::Uuid,
    slot: SessionSlot,
}

impl RealtimeHandle {
    pub(crate) fn new(id: uuid::Uuid, slot: SessionSlot) -> Self {
        Self { id, slot }
    }

    /// Stop this session. Does nothing if it was already replaced or stopped.
    pub fn stop(&self) {
        drop(take_session(&self.slot, Some(self.id)));
    }

    /// Whether this session is still the engine's active one.
    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|session| session.id() == self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryLocalStore;
    use crate::local::LocalStore;
    use crate::state::{Acquire, SyncState, UploadPermit};
    use crate::Record;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample(n: i64) -> Collection {
        vec![Record::from_value(json!({"id": n, "name": format!("r{n}")})).unwrap()].into()
    }

    struct Fixture {
        state: SharedState,
        local: LocalReplica,
        calls: Arc<AtomicUsize>,
        filter: RealtimeFilter,
    }

    fn fixture() -> Fixture {
        let state: SharedState = Arc::new(Mutex::new(SyncState::new(true)));
        let local = LocalReplica::new(MemoryLocalStore::new_shared(), "test_");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let filter = RealtimeFilter::new(
            Arc::clone(&state),
            local.clone(),
            UserKey::user("u1"),
            Arc::new(move |_update: RealtimeUpdate| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Fixture {
            state,
            local,
            calls,
            filter,
        }
    }

    #[test]
    fn external_change_is_forwarded_and_persisted() {
        let f = fixture();
        let admission = f.filter.handle(sample(1), SnapshotMetadata::default());

        assert_eq!(admission, Admission::Accepted);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.local.load(&UserKey::user("u1")), sample(1));
        assert_eq!(lock(&f.state).last_synced, Some(fingerprint(&sample(1))));
    }

    #[test]
    fn repeated_snapshot_is_an_echo() {
        let f = fixture();
        f.filter.handle(sample(1), SnapshotMetadata::default());
        let admission = f.filter.handle(sample(1), SnapshotMetadata::default());

        assert_eq!(admission, Admission::Echo);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshots_during_upload_are_dropped() {
        let f = fixture();
        let permit = match UploadPermit::acquire(&f.state) {
            Acquire::Ready(permit) => permit,
            Acquire::Queued(_) => panic!("permit should be free"),
        };

        assert_eq!(
            f.filter.handle(sample(2), SnapshotMetadata::default()),
            Admission::InFlight
        );
        assert!(f.local.load(&UserKey::user("u1")).is_empty());

        drop(permit);
        assert_eq!(
            f.filter.handle(sample(2), SnapshotMetadata::default()),
            Admission::Accepted
        );
    }

    #[test]
    fn delivery_is_refused_while_uploading() {
        let f = fixture();
        assert!(f.filter.accepts_delivery());

        let permit = match UploadPermit::acquire(&f.state) {
            Acquire::Ready(permit) => permit,
            Acquire::Queued(_) => panic!("permit should be free"),
        };
        assert!(!f.filter.accepts_delivery());

        drop(permit);
        assert!(f.filter.accepts_delivery());
    }

    /// Local store that records whether the sync state was locked during a write.
    struct LockWatchingStore {
        state: SharedState,
        writes: AtomicUsize,
        writes_under_lock: AtomicUsize,
    }

    impl LocalStore for LockWatchingStore {
        fn get(&self, _key: &str) -> crate::Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> crate::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.state.try_lock().is_err() {
                self.writes_under_lock.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn remove(&self, _key: &str) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn local_write_and_fingerprint_update_are_atomic() {
        let state: SharedState = Arc::new(Mutex::new(SyncState::new(true)));
        let store = Arc::new(LockWatchingStore {
            state: Arc::clone(&state),
            writes: AtomicUsize::new(0),
            writes_under_lock: AtomicUsize::new(0),
        });
        let filter = RealtimeFilter::new(
            Arc::clone(&state),
            LocalReplica::new(store.clone(), "test_"),
            UserKey::user("u1"),
            Arc::new(|_update: RealtimeUpdate| {}),
        );

        assert_eq!(
            filter.handle(sample(6), SnapshotMetadata::default()),
            Admission::Accepted
        );
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(store.writes_under_lock.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_is_forwarded() {
        let state: SharedState = Arc::new(Mutex::new(SyncState::new(true)));
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let filter = RealtimeFilter::new(
            state,
            LocalReplica::new(MemoryLocalStore::new_shared(), "test_"),
            UserKey::user("u1"),
            Arc::new(move |update: RealtimeUpdate| {
                *sink.lock().unwrap() = Some(update);
            }),
        );

        filter.handle(
            sample(3),
            SnapshotMetadata {
                from_cache: true,
                has_pending_writes: true,
            },
        );

        let update = seen.lock().unwrap().clone().unwrap();
        assert!(update.from_cache);
        assert!(update.has_pending_writes);
        assert_eq!(update.items, sample(3));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let state: SharedState = Arc::new(Mutex::new(SyncState::new(true)));
        let filter = RealtimeFilter::new(
            Arc::clone(&state),
            LocalReplica::new(MemoryLocalStore::new_shared(), "test_"),
            UserKey::user("u1"),
            Arc::new(|_update: RealtimeUpdate| panic!("callback bug")),
        );

        assert_eq!(
            filter.handle(sample(4), SnapshotMetadata::default()),
            Admission::Accepted
        );
        assert_eq!(
            filter.handle(sample(4), SnapshotMetadata::default()),
            Admission::Echo
        );
    }

    #[tokio::test]
    async fn pump_runs_until_channel_closes() {
        let f = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Ok(crate::remote::Snapshot {
            collection: sample(5),
            metadata: SnapshotMetadata::default(),
        }))
        .unwrap();
        tx.send(Err(crate::Error::Network("blip".into()))).unwrap();
        drop(tx);

        f.filter.clone().pump(rx).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }
}
