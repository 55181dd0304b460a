//! # Tandem Engine
//!
//! Keeps a device's local copy of a user's record collection consistent with
//! a shared remote copy.
//!
//! The engine fingerprints collections to detect change, reconciles divergent
//! edits under a configurable conflict strategy, serializes uploads so only
//! one remote write runs at a time, and filters realtime notifications so the
//! engine never reacts to echoes of its own writes.
//!
//! ## Design Principles
//!
//! - **Injected collaborators**: identity, local storage and the remote
//!   document store are traits passed in at construction
//! - **One owner of state**: sync state lives in a [`SyncEngine`] instance,
//!   guarded by a single lock that is never held across an await
//! - **Best-effort local cache**: a broken local store degrades to an empty
//!   collection instead of failing a sync
//!
//! ## Core Concepts
//!
//! ### Records and collections
//!
//! A [`Record`] is an application-owned JSON object with an `id` and an
//! `updatedAt`. A [`Collection`] is an ordered list of records and is stored
//! remotely as a single document per user.
//!
//! ### Conflict strategies
//!
//! [`ConflictStrategy`] selects how [`Merger`] combines local and remote
//! collections:
//! - [`ConflictStrategy::ServerWins`] / [`ConflictStrategy::LocalWins`] - one side verbatim
//! - [`ConflictStrategy::LatestWins`] - newer `updatedAt` wins per record (default)
//! - [`ConflictStrategy::Merge`] - field-level merge
//! - [`ConflictStrategy::Manual`] - conflicts are returned to the caller
//!
//! ### Realtime
//!
//! [`SyncEngine::start_realtime_sync`] subscribes to the remote document and
//! forwards only genuine external changes.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem_engine::{
//!     AuthMonitor, Collection, EngineConfig, MemoryLocalStore, MemoryRemoteStore, Record,
//!     SyncEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let auth = Arc::new(AuthMonitor::signed_in("user-1"));
//!     let engine = SyncEngine::new_shared(
//!         EngineConfig::default(),
//!         auth,
//!         MemoryLocalStore::new_shared(),
//!         MemoryRemoteStore::new_shared(),
//!     );
//!
//!     let items: Collection = vec![
//!         Record::from_value(json!({"id": 1, "updatedAt": "2024-01-01"})).unwrap(),
//!     ]
//!     .into();
//!
//!     let outcome = engine.upload_collection(items.clone()).await;
//!     assert!(outcome.success);
//!     assert_eq!(engine.load_local(), items);
//!     assert!(!engine.get_sync_status().is_syncing);
//! }
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig::load`] reads `SYNC_*` environment variables (after loading
//! a `.env` file if present). The library never installs a tracing
//! subscriber; hosts configure logging.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod local;
pub mod merge;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod retry;
pub mod session;
mod state;
pub mod status;

// Re-export main types at crate root
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{SyncEngine, SyncOutcome, SyncStatusReport};
pub use error::{Error, ErrorKind, Result};
pub use fingerprint::{fingerprint, Fingerprint, EMPTY_FINGERPRINT};
pub use local::{FileLocalStore, LocalReplica, LocalStore, MemoryLocalStore};
pub use merge::{merge, Conflict, ConflictStrategy, MergeOutcome, Merger};
pub use realtime::{Admission, RealtimeHandle, RealtimeUpdate, UpdateCallback};
pub use record::{Collection, Record};
pub use remote::{
    MemoryRemoteStore, ReadSource, RemoteReplica, RemoteStore, Snapshot, SnapshotEvent,
    SnapshotMetadata, SnapshotSender, Subscription,
};
pub use retry::RetryPolicy;
pub use session::{
    AuthMonitor, AuthState, Connectivity, ConnectivityMonitor, Identity, NetworkStatus, UserKey,
};
pub use status::{ListenerHandle, SyncDirection, SyncEvent, SyncStatus};

/// Epoch milliseconds.
pub type Timestamp = i64;
