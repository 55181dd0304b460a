//! Remote replica: the shared, authoritative copy of the collection.
//!
//! The remote store holds the whole collection as one document per user.
//! [`RemoteReplica`] wraps a [`RemoteStore`] client with the engine's read and
//! retry policy:
//!
//! - reads go to the server first; if the server is unreachable the store's
//!   own client-side cache is consulted, and if that has nothing the original
//!   server error is returned;
//! - every remote call is retried with exponential backoff, except for
//!   permission-class errors which fail immediately.

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    session::UserKey,
    Collection,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a read is answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Ask the server.
    Server,
    /// Answer from the client-side cache of the store SDK.
    Cache,
}

/// Metadata delivered with every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Snapshot came from the local cache rather than the server
    pub from_cache: bool,
    /// Snapshot includes writes not yet acknowledged by the server
    pub has_pending_writes: bool,
}

/// A version of the remote document.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Collection held by the document.
    pub collection: Collection,
    /// Delivery metadata.
    pub metadata: SnapshotMetadata,
}

/// Item delivered on a subscription channel.
pub type SnapshotEvent = Result<Snapshot>;

/// Decides at delivery time whether a snapshot may be enqueued.
type Gate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Sender half handed to [`RemoteStore::subscribe`].
///
/// The engine may attach a gate that is consulted when the store delivers a
/// snapshot, before it is queued. Rejected snapshots are dropped on the spot;
/// errors always go through.
#[derive(Clone)]
pub struct SnapshotSender {
    tx: mpsc::UnboundedSender<SnapshotEvent>,
    gate: Option<Gate>,
}

impl SnapshotSender {
    /// Wrap a channel sender.
    pub fn new(tx: mpsc::UnboundedSender<SnapshotEvent>) -> Self {
        Self { tx, gate: None }
    }

    pub(crate) fn gated(
        tx: mpsc::UnboundedSender<SnapshotEvent>,
        gate: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            tx,
            gate: Some(Arc::new(gate)),
        }
    }

    /// Deliver an event. Returns `false` once the receiving side is gone.
    pub fn send(&self, event: SnapshotEvent) -> bool {
        if event.is_ok() {
            if let Some(gate) = &self.gate {
                if !gate() {
                    return !self.tx.is_closed();
                }
            }
        }
        self.tx.send(event).is_ok()
    }

    /// Whether the receiving side was dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl From<mpsc::UnboundedSender<SnapshotEvent>> for SnapshotSender {
    fn from(tx: mpsc::UnboundedSender<SnapshotEvent>) -> Self {
        Self::new(tx)
    }
}

impl std::fmt::Debug for SnapshotSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSender")
            .field("gated", &self.gate.is_some())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Handle to a live subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap the provider's unsubscribe callback.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving snapshots.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Client for the remote document store.
///
/// Implementations must classify provider errors into [`Error`] variants:
/// unreachable or timed out as `Network`/`Timeout`, unauthenticated or
/// forbidden as `Permission`, undecodable documents as `DataIntegrity`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the user's document. `Ok(None)` means it does not exist (or, for
    /// cache reads, is not cached).
    async fn fetch(&self, key: &UserKey, source: ReadSource) -> Result<Option<Snapshot>>;

    /// Replace the user's document.
    async fn save(&self, key: &UserKey, collection: &Collection) -> Result<()>;

    /// Deliver every new version of the user's document to `sender` until the
    /// returned subscription is dropped.
    fn subscribe(&self, key: &UserKey, sender: SnapshotSender) -> Result<Subscription>;
}

/// Remote store access with the engine's read and retry policy.
#[derive(Clone)]
pub struct RemoteReplica {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl RemoteReplica {
    /// Create a replica over a store client.
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// The retry policy in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch the collection, server first with cache fallback.
    ///
    /// A missing document is an empty collection.
    pub async fn fetch(&self, key: &UserKey) -> Result<Collection> {
        let server = self
            .retry
            .run("fetch", || self.store.fetch(key, ReadSource::Server))
            .await;

        let server_err = match server {
            Ok(snapshot) => return Ok(snapshot.map(|s| s.collection).unwrap_or_default()),
            Err(e) if e.is_offline() => e,
            Err(e) => return Err(e),
        };

        match self.store.fetch(key, ReadSource::Cache).await {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    user = %key,
                    items = snapshot.collection.len(),
                    error = %server_err,
                    "Server unreachable, using cached remote collection"
                );
                Ok(snapshot.collection)
            }
            Ok(None) => Err(server_err),
            Err(cache_err) => {
                tracing::debug!(user = %key, error = %cache_err, "Cache read failed");
                Err(server_err)
            }
        }
    }

    /// Save the collection.
    pub async fn save(&self, key: &UserKey, collection: &Collection) -> Result<()> {
        self.retry
            .run("save", || self.store.save(key, collection))
            .await
    }

    /// Subscribe to document changes.
    pub fn subscribe(&self, key: &UserKey, sender: SnapshotSender) -> Result<Subscription> {
        self.store.subscribe(key, sender)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live subscriber of [`MemoryRemoteStore`].
#[derive(Debug)]
struct Subscriber {
    key: UserKey,
    client: uuid::Uuid,
    sender: SnapshotSender,
}

/// Server side shared by every client of one in-memory store.
#[derive(Debug, Default)]
struct Backend {
    documents: DashMap<String, Collection>,
    subscribers: DashMap<String, Subscriber>,
}

/// In-memory [`RemoteStore`] with fault injection.
///
/// Each value is one client (one device's SDK) of a shared server.
/// [`connect`](Self::connect) opens another client on the same server.
/// Server documents and subscriptions are shared; the client-side cache,
/// network state, injected faults and call counters belong to the client. A
/// successful server read or write refreshes the cache, and cache reads keep
/// working while the client is offline.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    client: uuid::Uuid,
    backend: Arc<Backend>,
    cache: DashMap<String, Collection>,
    offline: AtomicBool,
    failures: Mutex<VecDeque<Error>>,
    save_latency: Mutex<Duration>,
    fetch_calls: AtomicUsize,
    save_calls: AtomicUsize,
    saves_in_flight: AtomicUsize,
    max_concurrent_saves: AtomicUsize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::with_backend(Arc::default())
    }
}

impl MemoryRemoteStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn with_backend(backend: Arc<Backend>) -> Self {
        Self {
            client: uuid::Uuid::new_v4(),
            backend,
            cache: DashMap::new(),
            offline: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
            save_latency: Mutex::new(Duration::ZERO),
            fetch_calls: AtomicUsize::new(0),
            save_calls: AtomicUsize::new(0),
            saves_in_flight: AtomicUsize::new(0),
            max_concurrent_saves: AtomicUsize::new(0),
        }
    }

    /// Open another client on the same server, as a second device would.
    pub fn connect(&self) -> Arc<Self> {
        Arc::new(Self::with_backend(Arc::clone(&self.backend)))
    }

    /// Make server reads and writes fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `times` server calls with `error`.
    pub fn fail_next(&self, error: Error, times: usize) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(error).take(times));
    }

    /// Delay every save by `latency`.
    pub fn set_save_latency(&self, latency: Duration) {
        *lock(&self.save_latency) = latency;
    }

    /// Server document for a key.
    pub fn document(&self, key: &UserKey) -> Option<Collection> {
        self.backend
            .documents
            .get(key.as_str())
            .map(|c| c.value().clone())
    }

    /// Seed the client-side cache without touching the server document.
    pub fn seed_cache(&self, key: &UserKey, collection: Collection) {
        self.cache.insert(key.as_str().to_string(), collection);
    }

    /// Server fetches attempted by this client so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Saves attempted by this client so far.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Highest number of this client's saves observed running at the same time.
    pub fn max_concurrent_saves(&self) -> usize {
        self.max_concurrent_saves.load(Ordering::SeqCst)
    }

    /// Active subscriptions across all clients.
    pub fn subscriber_count(&self) -> usize {
        self.backend.subscribers.len()
    }

    fn check_server(&self) -> Result<()> {
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("remote store unreachable".into()));
        }
        Ok(())
    }

    /// Deliver a snapshot to subscribers of `key`. With `only_client`, just
    /// that client's subscribers receive it.
    fn broadcast(
        &self,
        key: &UserKey,
        collection: &Collection,
        metadata: SnapshotMetadata,
        only_client: Option<uuid::Uuid>,
    ) {
        let mut delivered = 0;
        for entry in self.backend.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.key != *key || only_client.is_some_and(|c| c != subscriber.client) {
                continue;
            }
            let snapshot = Snapshot {
                collection: collection.clone(),
                metadata,
            };
            if subscriber.sender.send(Ok(snapshot)) {
                delivered += 1;
            }
        }
        tracing::debug!(user = %key, recipients = delivered, "Broadcast remote snapshot");
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(&self, key: &UserKey, source: ReadSource) -> Result<Option<Snapshot>> {
        match source {
            ReadSource::Cache => Ok(self.cache.get(key.as_str()).map(|c| Snapshot {
                collection: c.value().clone(),
                metadata: SnapshotMetadata {
                    from_cache: true,
                    has_pending_writes: false,
                },
            })),
            ReadSource::Server => {
                self.fetch_calls.fetch_add(1, Ordering::SeqCst);
                self.check_server()?;
                let document = self.document(key);
                if let Some(collection) = &document {
                    self.cache
                        .insert(key.as_str().to_string(), collection.clone());
                }
                Ok(document.map(|collection| Snapshot {
                    collection,
                    metadata: SnapshotMetadata::default(),
                }))
            }
        }
    }

    async fn save(&self, key: &UserKey, collection: &Collection) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.saves_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_saves.fetch_max(running, Ordering::SeqCst);

        // Latency-compensated echo, delivered only to the writing client.
        self.broadcast(
            key,
            collection,
            SnapshotMetadata {
                from_cache: true,
                has_pending_writes: true,
            },
            Some(self.client),
        );

        let latency = *lock(&self.save_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self.check_server();
        if result.is_ok() {
            self.backend
                .documents
                .insert(key.as_str().to_string(), collection.clone());
            self.cache
                .insert(key.as_str().to_string(), collection.clone());
            self.broadcast(key, collection, SnapshotMetadata::default(), None);
        }

        self.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn subscribe(&self, key: &UserKey, sender: SnapshotSender) -> Result<Subscription> {
        let id = uuid::Uuid::new_v4().to_string();
        self.backend.subscribers.insert(
            id.clone(),
            Subscriber {
                key: key.clone(),
                client: self.client,
                sender,
            },
        );
        tracing::info!(subscription = %id, user = %key, client = %self.client, "Remote subscription registered");

        let backend = Arc::clone(&self.backend);
        Ok(Subscription::new(move || {
            if backend.subscribers.remove(&id).is_some() {
                tracing::info!(subscription = %id, "Remote subscription removed");
            }
        }))
    }
}
