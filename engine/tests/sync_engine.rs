//! End-to-end sync scenarios for tandem-engine
//!
//! These tests wire a SyncEngine to the in-memory stores and exercise upload
//! serialization, realtime filtering, retries and lifecycle handling.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_engine::{
    AuthMonitor, Collection, ConflictStrategy, ConnectivityMonitor, EngineConfig, Error,
    ErrorKind, MemoryLocalStore, MemoryRemoteStore, NetworkStatus, Record, RemoteStore,
    RetryPolicy, SyncDirection, SyncEngine, SyncEvent, SyncStatus, UserKey,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn records(values: Vec<serde_json::Value>) -> Collection {
    values.into_iter().filter_map(Record::from_value).collect()
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_retry(
            RetryPolicy::new(2)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2)),
        )
        .with_queue_drain_delay(Duration::from_millis(2))
}

struct Device {
    auth: Arc<AuthMonitor>,
    engine: Arc<SyncEngine>,
}

fn device(user: &str, remote: &Arc<MemoryRemoteStore>) -> Device {
    device_with(user, remote, fast_config())
}

fn device_with(user: &str, remote: &Arc<MemoryRemoteStore>, config: EngineConfig) -> Device {
    init_tracing();
    let auth = Arc::new(AuthMonitor::signed_in(user));
    let engine = SyncEngine::new_shared(
        config,
        auth.clone(),
        MemoryLocalStore::new_shared(),
        remote.clone(),
    );
    Device { auth, engine }
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn recorder(engine: &SyncEngine) -> (Arc<Mutex<Vec<SyncEvent>>>, tandem_engine::ListenerHandle) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handle = engine.on_sync_status_change(move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    (events, handle)
}

// ============================================================================
// Single-flight uploads
// ============================================================================

#[tokio::test]
async fn concurrent_uploads_run_one_at_a_time() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_save_latency(Duration::from_millis(30));
    let Device { engine, .. } = device("u1", &remote);
    let (events, _handle) = recorder(&engine);

    let first = records(vec![json!({"id": 1})]);
    let second = records(vec![json!({"id": 1}), json!({"id": 2})]);

    let (a, b) = futures::join!(
        engine.upload_collection(first.clone()),
        engine.upload_collection(second.clone())
    );

    assert!(a.success);
    assert!(b.success);
    assert_eq!(remote.save_calls(), 2);
    assert_eq!(remote.max_concurrent_saves(), 1);
    // FIFO: the queued upload ran last
    assert_eq!(remote.document(&UserKey::user("u1")), Some(second.clone()));
    assert_eq!(engine.load_local(), second);

    let statuses: Vec<SyncStatus> = events.lock().unwrap().iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            SyncStatus::Syncing,
            SyncStatus::Success,
            SyncStatus::Syncing,
            SyncStatus::Success,
            SyncStatus::Idle
        ]
    );
    assert!(!engine.get_sync_status().is_syncing);
}

#[tokio::test]
async fn queue_drains_after_failure() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_save_latency(Duration::from_millis(20));
    let Device { engine, .. } = device_with(
        "u1",
        &remote,
        fast_config().with_retry(RetryPolicy::no_retry()),
    );
    remote.fail_next(Error::Permission("forbidden".into()), 1);

    let (a, b) = futures::join!(
        engine.upload_collection(records(vec![json!({"id": 1})])),
        engine.upload_collection(records(vec![json!({"id": 2})]))
    );

    assert!(!a.success);
    assert_eq!(a.error_kind, Some(ErrorKind::Permission));
    assert!(b.success);
    assert_eq!(remote.max_concurrent_saves(), 1);
}

#[tokio::test]
async fn pending_uploads_are_reported() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_save_latency(Duration::from_millis(60));
    let Device { engine, .. } = device("u1", &remote);

    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 1})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().is_syncing).await);

    let queued = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 2})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().pending_uploads == 1).await);

    assert!(running.await.unwrap().success);
    assert!(queued.await.unwrap().success);
    assert_eq!(engine.get_sync_status().pending_uploads, 0);
}

// ============================================================================
// Realtime filtering
// ============================================================================

#[tokio::test]
async fn own_writes_are_not_forwarded() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { engine, .. } = device("u1", &remote);

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let _session = engine
        .start_realtime_sync(move |_update| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let items = records(vec![json!({"id": 1, "name": "mine"})]);
    assert!(engine.upload_collection(items.clone()).await.success);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert_eq!(engine.load_local(), items);
}

#[tokio::test]
async fn changes_from_another_device_are_forwarded() {
    let remote = MemoryRemoteStore::new_shared();
    let phone = device("u1", &remote);
    let laptop = device("u1", &remote.connect());

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _session = phone
        .engine
        .start_realtime_sync(move |update| sink.lock().unwrap().push(update))
        .unwrap();

    let items = records(vec![json!({"id": 7, "name": "from laptop"})]);
    assert!(laptop.engine.upload_collection(items.clone()).await.success);

    assert!(wait_until(|| phone.engine.load_local() == items).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].items, items);
    assert_eq!(
        phone.engine.get_sync_status().last_synced_fingerprint,
        Some(tandem_engine::fingerprint(&items))
    );
}

#[tokio::test]
async fn other_users_changes_are_invisible() {
    let remote = MemoryRemoteStore::new_shared();
    let alice = device("alice", &remote);
    let bob = device("bob", &remote.connect());

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let _session = alice
        .engine
        .start_realtime_sync(move |_update| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(bob
        .engine
        .upload_collection(records(vec![json!({"id": 1})]))
        .await
        .success);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert!(alice.engine.load_local().is_empty());
}

#[tokio::test]
async fn echo_of_a_failed_upload_is_not_forwarded() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { engine, .. } = device_with(
        "u1",
        &remote,
        fast_config().with_retry(RetryPolicy::no_retry()),
    );

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let _session = engine
        .start_realtime_sync(move |_update| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    remote.fail_next(Error::Network("connection reset".into()), 1);
    let outcome = engine
        .upload_collection(records(vec![json!({"id": 3, "name": "rejected"})]))
        .await;
    assert!(!outcome.success);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert_eq!(remote.document(&UserKey::user("u1")), None);
    assert_eq!(engine.get_sync_status().last_synced_fingerprint, None);
    assert!(engine.load_local().is_empty());
}

#[tokio::test]
async fn pending_write_echo_reaches_only_the_writer() {
    let remote = MemoryRemoteStore::new_shared();
    let phone = device("u1", &remote);
    let laptop_remote = remote.connect();
    let laptop = device("u1", &laptop_remote);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _session = phone
        .engine
        .start_realtime_sync(move |update| sink.lock().unwrap().push(update))
        .unwrap();

    let items = records(vec![json!({"id": 9})]);
    assert!(laptop.engine.upload_collection(items.clone()).await.success);
    assert!(wait_until(|| !received.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].has_pending_writes);
    assert!(!received[0].from_cache);
    assert_eq!(laptop_remote.save_calls(), 1);
    assert_eq!(remote.save_calls(), 0);
}

#[tokio::test]
async fn stopping_realtime_unsubscribes() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { engine, .. } = device("u1", &remote);

    let first = engine.start_realtime_sync(|_| {}).unwrap();
    assert_eq!(remote.subscriber_count(), 1);

    // Starting again replaces the running session
    let second = engine.start_realtime_sync(|_| {}).unwrap();
    assert_eq!(remote.subscriber_count(), 1);
    assert!(!first.is_active());
    assert!(second.is_active());

    first.stop();
    assert!(engine.is_realtime_active());

    second.stop();
    assert!(!engine.is_realtime_active());
    assert_eq!(remote.subscriber_count(), 0);
}

// ============================================================================
// Retries and errors
// ============================================================================

#[tokio::test]
async fn upload_retries_network_errors_until_exhausted() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_offline(true);
    let Device { engine, .. } = device("u1", &remote);
    let (events, _handle) = recorder(&engine);

    let outcome = engine.upload_collection(records(vec![json!({"id": 1})])).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::NetworkTransient));
    assert_eq!(remote.save_calls(), 3);

    let events = events.lock().unwrap();
    let failure = events
        .iter()
        .find(|e| e.status == SyncStatus::Error)
        .unwrap();
    assert_eq!(failure.direction, SyncDirection::Upload);
    assert!(failure.error.as_deref().unwrap().starts_with("Sync failed"));
    assert_eq!(events.last().unwrap().status, SyncStatus::Idle);
}

#[tokio::test]
async fn permission_errors_are_attempted_once() {
    let remote = MemoryRemoteStore::new_shared();
    remote.fail_next(Error::Permission("forbidden".into()), 1);
    let Device { engine, .. } = device("u1", &remote);

    let outcome = engine.upload_collection(records(vec![json!({"id": 1})])).await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::Permission));
    assert_eq!(remote.save_calls(), 1);
}

#[tokio::test]
async fn unauthenticated_engine_makes_no_remote_calls() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { auth, engine } = device("u1", &remote);
    auth.sign_out();

    let upload = engine.upload_collection(records(vec![json!({"id": 1})])).await;
    let download = engine.download_collection(false).await;

    assert!(!upload.success);
    assert!(!download.success);
    assert_eq!(upload.error_kind, Some(ErrorKind::Unauthenticated));
    assert_eq!(remote.save_calls() + remote.fetch_calls(), 0);
}

#[tokio::test]
async fn offline_download_uses_cached_remote() {
    let remote = MemoryRemoteStore::new_shared();
    let items = records(vec![json!({"id": 1})]);
    remote.save(&UserKey::user("u1"), &items).await.unwrap();
    remote.set_offline(true);

    let Device { engine, .. } = device("u1", &remote);
    let outcome = engine.download_collection(false).await;

    assert!(outcome.success);
    assert_eq!(engine.load_local(), items);
}

#[tokio::test]
async fn listener_panic_does_not_break_notification() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { engine, .. } = device("u1", &remote);

    let _bad = engine.on_sync_status_change(|_| panic!("listener bug"));
    let (events, _good) = recorder(&engine);

    assert!(engine
        .upload_collection(records(vec![json!({"id": 1})]))
        .await
        .success);
    // Syncing, Success, Idle
    assert_eq!(events.lock().unwrap().len(), 3);
}

// ============================================================================
// Downloads and merging
// ============================================================================

#[tokio::test]
async fn latest_wins_download_keeps_newer_local_edit() {
    let remote = MemoryRemoteStore::new_shared();
    remote
        .save(
            &UserKey::user("u1"),
            &records(vec![
                json!({"id": 1, "name": "old", "updatedAt": "2024-01-01"}),
                json!({"id": 2, "name": "remote only", "updatedAt": "2024-01-01"}),
            ]),
        )
        .await
        .unwrap();

    let Device { engine, .. } = device("u1", &remote);
    engine.save_local(&records(vec![
        json!({"id": 1, "name": "new", "updatedAt": "2024-01-02"}),
    ]));

    let outcome = engine.download_collection(true).await;
    assert!(outcome.success);
    assert_eq!(outcome.direction, SyncDirection::Merge);

    let local = engine.load_local();
    assert_eq!(local.len(), 2);
    assert_eq!(local.find("1").unwrap().get("name"), Some(&json!("new")));
    assert!(local.find("2").is_some());
}

#[tokio::test]
async fn manual_conflicts_are_returned_to_caller() {
    let remote = MemoryRemoteStore::new_shared();
    remote
        .save(
            &UserKey::user("u1"),
            &records(vec![json!({"id": 1, "name": "remote"})]),
        )
        .await
        .unwrap();

    let Device { engine, .. } = device("u1", &remote);
    engine.set_conflict_strategy(ConflictStrategy::Manual);
    let local = records(vec![json!({"id": 1, "name": "local"})]);
    engine.save_local(&local);

    let outcome = engine.download_collection(true).await;

    assert!(!outcome.success);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].id, json!(1));
    assert_eq!(outcome.conflicts[0].local.get("name"), Some(&json!("local")));
    assert_eq!(outcome.conflicts[0].remote.get("name"), Some(&json!("remote")));
    // Nothing is persisted until the caller resolves the conflicts
    assert_eq!(engine.load_local(), local);
}

#[tokio::test]
async fn sync_now_uploads_only_when_merge_changed_something() {
    let remote = MemoryRemoteStore::new_shared();
    let items = records(vec![json!({"id": 1, "updatedAt": "2024-01-01"})]);
    remote.save(&UserKey::user("u1"), &items).await.unwrap();

    let Device { engine, .. } = device("u1", &remote);
    let outcome = engine.sync_now().await;
    assert!(outcome.success);
    assert_eq!(remote.save_calls(), 1);

    engine.save_local(&records(vec![
        json!({"id": 1, "updatedAt": "2024-01-01"}),
        json!({"id": 2, "updatedAt": "2024-01-03"}),
    ]));
    let outcome = engine.sync_now().await;
    assert!(outcome.success);
    assert_eq!(outcome.direction, SyncDirection::Upload);
    assert_eq!(remote.save_calls(), 2);
    assert_eq!(remote.document(&UserKey::user("u1")).unwrap().len(), 2);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn clear_sync_state_cancels_queued_uploads() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_save_latency(Duration::from_millis(60));
    let Device { engine, .. } = device("u1", &remote);
    let _session = engine.start_realtime_sync(|_| {}).unwrap();

    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 1})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().is_syncing).await);

    let queued = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 2})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().pending_uploads == 1).await);

    engine.clear_sync_state();

    let queued = queued.await.unwrap();
    assert!(!queued.success);
    assert_eq!(queued.items, records(vec![json!({"id": 2})]));

    // The running upload finishes but is no longer recorded as the last sync
    assert!(running.await.unwrap().success);
    let status = engine.get_sync_status();
    assert_eq!(status.last_synced_fingerprint, None);
    assert_eq!(status.last_sync_time, None);
    assert!(!status.is_syncing);
    assert!(!engine.is_realtime_active());
    assert_eq!(remote.save_calls(), 1);
}

#[tokio::test]
async fn queued_upload_fails_once_the_session_ends() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_save_latency(Duration::from_millis(30));
    let Device { auth, engine } = device("u1", &remote);

    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 1})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().is_syncing).await);

    let queued = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 2})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().pending_uploads == 1).await);

    auth.sign_out();

    assert!(running.await.unwrap().success);
    let queued = queued.await.unwrap();
    assert!(!queued.success);
    assert_eq!(queued.error_kind, Some(ErrorKind::Unauthenticated));
    assert_eq!(remote.save_calls(), 1);
    assert_eq!(remote.document(&UserKey::user("anonymous")), None);
    assert!(!engine.get_sync_status().is_syncing);
}

#[tokio::test]
async fn queued_upload_never_switches_user() {
    let remote = MemoryRemoteStore::new_shared();
    remote.set_save_latency(Duration::from_millis(30));
    let Device { auth, engine } = device("alice", &remote);

    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 1})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().is_syncing).await);

    let queued = tokio::spawn({
        let engine = engine.clone();
        async move { engine.upload_collection(records(vec![json!({"id": 2})])).await }
    });
    assert!(wait_until(|| engine.get_sync_status().pending_uploads == 1).await);

    auth.sign_in("bob");

    assert!(running.await.unwrap().success);
    let queued = queued.await.unwrap();
    assert_eq!(queued.error_kind, Some(ErrorKind::Unauthenticated));
    assert_eq!(remote.document(&UserKey::user("alice")), Some(records(vec![json!({"id": 1})])));
    assert_eq!(remote.document(&UserKey::user("bob")), None);
}

#[tokio::test]
async fn sign_out_clears_state() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { auth, engine } = device("u1", &remote);
    let _watch = engine.watch_session(&auth);

    assert!(engine
        .upload_collection(records(vec![json!({"id": 1})]))
        .await
        .success);
    let _session = engine.start_realtime_sync(|_| {}).unwrap();
    assert!(engine.get_sync_status().last_synced_fingerprint.is_some());

    auth.sign_out();

    assert!(wait_until(|| !engine.is_realtime_active()).await);
    assert_eq!(engine.get_sync_status().last_synced_fingerprint, None);
}

#[tokio::test]
async fn reconnect_triggers_sync() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { engine, .. } = device("u1", &remote);
    let network = ConnectivityMonitor::new(NetworkStatus::offline());
    let _watch = engine.watch_connectivity(&network);

    let offline_edits = records(vec![json!({"id": 1, "updatedAt": "2024-05-01"})]);
    engine.save_local(&offline_edits);

    network.set_status(NetworkStatus::connected());

    assert!(wait_until(|| remote.document(&UserKey::user("u1")) == Some(offline_edits.clone())).await);
}

#[tokio::test]
async fn reconnect_without_auto_sync_does_nothing() {
    let remote = MemoryRemoteStore::new_shared();
    let Device { engine, .. } = device_with("u1", &remote, fast_config().with_auto_sync(false));
    let network = ConnectivityMonitor::new(NetworkStatus::offline());
    let _watch = engine.watch_connectivity(&network);

    engine.save_local(&records(vec![json!({"id": 1})]));
    network.set_status(NetworkStatus::connected());
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(remote.fetch_calls(), 0);
    assert_eq!(remote.save_calls(), 0);
}
