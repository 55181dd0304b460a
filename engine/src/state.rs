//! Shared sync state and the single-flight upload permit.
//!
//! All reads and writes of [`SyncState`] happen under one mutex. The lock is
//! never held across an `.await`, so every critical section is a short,
//! synchronous state flip. A local replica write that goes with a fingerprint
//! update is made inside the same critical section, so the replica and
//! `last_synced` always describe the same collection.
//!
//! Uploads run one at a time. The running upload owns an [`UploadPermit`];
//! when the permit is dropped (success, failure or cancellation) it is handed
//! to the oldest queued waiter, or the `in_progress` flag is cleared when
//! nobody is waiting.

use crate::Fingerprint;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Process-wide sync bookkeeping, owned by the coordinator.
#[derive(Debug)]
pub(crate) struct SyncState {
    /// An upload holds the permit.
    pub in_progress: bool,
    /// Fingerprint of the collection last known to match the remote.
    pub last_synced: Option<Fingerprint>,
    /// When `last_synced` was recorded.
    pub last_sync_time: Option<DateTime<Utc>>,
    pub auto_sync_enabled: bool,
    /// Uploads waiting for the permit, oldest first.
    pub queue: VecDeque<oneshot::Sender<UploadPermit>>,
    /// Bumped on every clear so work started before it cannot write back.
    pub generation: u64,
}

impl SyncState {
    pub fn new(auto_sync_enabled: bool) -> Self {
        Self {
            in_progress: false,
            last_synced: None,
            last_sync_time: None,
            auto_sync_enabled,
            queue: VecDeque::new(),
            generation: 0,
        }
    }

    /// Record a collection as matching the remote, unless the state was
    /// cleared since `generation`.
    pub fn mark_synced(&mut self, generation: u64, fingerprint: Fingerprint) -> bool {
        if generation != self.generation {
            return false;
        }
        self.last_synced = Some(fingerprint);
        self.last_sync_time = Some(Utc::now());
        true
    }

    /// Forget sync history and cancel queued uploads.
    ///
    /// The queued senders are returned so the caller can drop them after
    /// releasing the lock.
    pub fn reset(&mut self) -> VecDeque<oneshot::Sender<UploadPermit>> {
        self.generation += 1;
        self.last_synced = None;
        self.last_sync_time = None;
        std::mem::take(&mut self.queue)
    }
}

pub(crate) type SharedState = Arc<Mutex<SyncState>>;

pub(crate) fn lock(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of asking for the upload permit.
pub(crate) enum Acquire {
    /// Nothing was running; the caller may upload now.
    Ready(UploadPermit),
    /// Another upload is running; the permit arrives on the receiver.
    Queued(oneshot::Receiver<UploadPermit>),
}

/// Exclusive right to run an upload.
#[derive(Debug)]
pub(crate) struct UploadPermit {
    state: SharedState,
    armed: bool,
}

impl UploadPermit {
    /// Take the permit if it is free, otherwise join the queue.
    pub fn acquire(state: &SharedState) -> Acquire {
        let mut guard = lock(state);
        if !guard.in_progress {
            guard.in_progress = true;
            return Acquire::Ready(Self::issue(state));
        }

        let (tx, rx) = oneshot::channel();
        guard.queue.push_back(tx);
        tracing::debug!(queued = guard.queue.len(), "Upload queued behind running sync");
        Acquire::Queued(rx)
    }

    fn issue(state: &SharedState) -> Self {
        Self {
            state: Arc::clone(state),
            armed: true,
        }
    }
}

impl UploadPermit {
    /// Give up the permit. Returns `true` when nobody was waiting and the
    /// engine went idle.
    pub fn release(mut self) -> bool {
        self.hand_off()
    }

    fn hand_off(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        self.armed = false;

        let mut guard = lock(&self.state);
        while let Some(waiter) = guard.queue.pop_front() {
            match waiter.send(Self::issue(&self.state)) {
                Ok(()) => {
                    tracing::debug!(remaining = guard.queue.len(), "Upload permit handed to queued sync");
                    return false;
                }
                // Waiter went away; the returned permit must not re-enter this lock.
                Err(mut unclaimed) => unclaimed.armed = false,
            }
        }
        guard.in_progress = false;
        true
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        self.hand_off();
    }
}
