//! Error handling and edge case tests.

use activity_sync::{
    sync_once, ColumnId, ColumnSpec, Engine, EngineConfig, EntityKind, FetchError, FetchOutcome,
    FetchRequest, FileSnapshotStorage, MemorySnapshotStorage, NormalizedResult, RemoteFetcher,
    ResourceType, SnapshotStorage, SubscriptionId, SubscriptionSpec, SyncError, SyncOutcome,
};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn failing(error: FetchError) -> Arc<dyn RemoteFetcher> {
    Arc::new(move |_: &FetchRequest| FetchOutcome::Failure(error.clone()))
}

fn repo_column(engine: &Engine) -> SubscriptionId {
    let column = engine
        .on_column_created(ColumnSpec {
            subscriptions: vec![SubscriptionSpec::new(ResourceType::RepoEvents)
                .param("owner", "rust-lang")
                .param("repo", "rust")],
            ..Default::default()
        })
        .unwrap();
    engine.column(&column).unwrap().subscription_ids[0].clone()
}

// --- Lookup Errors ---

#[test]
fn test_status_of_unknown_subscription() {
    let engine = Engine::default();
    let result = engine.get_subscription_status(&SubscriptionId("nope".into()));
    assert!(matches!(result, Err(SyncError::SubscriptionNotFound(_))));
}

#[test]
fn test_delete_unknown_column() {
    let engine = Engine::default();
    let result = engine.on_column_deleted(&ColumnId("nope".into()));
    assert!(matches!(result, Err(SyncError::ColumnNotFound(_))));
}

#[test]
fn test_queries_ignore_unknown_ids() {
    let engine = Engine::default();
    let ghost = SubscriptionId("ghost".into());
    assert!(engine.get_merged_events_for_subscriptions(&[ghost.clone()]).is_empty());
    assert!(engine.get_entities_for_notification_subscription(&[ghost]).is_empty());
}

// --- Registration Errors ---

#[test]
fn test_missing_parameter_rejected() {
    let engine = Engine::default();
    let result = engine.register_subscription(SubscriptionSpec::new(ResourceType::UserOrgEvents).param("username", "alice"));
    match result {
        Err(SyncError::MissingParameter { resource, param }) => {
            assert_eq!(resource, "USER_ORG_EVENTS");
            assert_eq!(param, "org");
        }
        other => panic!("expected MissingParameter, got {other:?}"),
    }

    let blank = engine.register_subscription(SubscriptionSpec::new(ResourceType::OrgEvents).param("org", "  "));
    assert!(matches!(blank, Err(SyncError::MissingParameter { .. })));
}

#[test]
fn test_registration_is_idempotent_across_param_case() {
    let engine = Engine::default();
    let a = engine
        .register_subscription(SubscriptionSpec::new(ResourceType::UserEvents).param("username", "Alice"))
        .unwrap();
    let b = engine
        .register_subscription(SubscriptionSpec::new(ResourceType::UserEvents).param("username", "alice"))
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(engine.subscription_ids().len(), 1);
}

// --- Normalization Errors ---

#[test]
fn test_unresolvable_root_is_error() {
    let engine = Engine::default();
    let result = engine.ingest(EntityKind::Event, json!({"type": "PushEvent"}));
    assert!(matches!(
        result,
        Err(SyncError::IdentityUnresolvable {
            kind: EntityKind::Event,
            ..
        })
    ));
    assert_eq!(engine.entity_count(EntityKind::Event), 0);
}

#[test]
fn test_unresolvable_elements_are_skipped() {
    let engine = Engine::default();
    let normalized = engine
        .ingest(
            EntityKind::Event,
            json!([
                {"id": "1", "type": "PushEvent", "actor": {"avatar_url": "no identity"}},
                {"type": "PushEvent"},
                {"id": "2", "type": "WatchEvent"},
                42,
            ]),
        )
        .unwrap();

    assert_eq!(
        normalized.result,
        NormalizedResult::Many(vec!["1".into(), "2".into()])
    );
    // The bad actor, the anonymous event and the number.
    assert_eq!(normalized.skipped, 3);
    assert_eq!(engine.entity_count(EntityKind::Event), 2);
    assert_eq!(engine.entity_count(EntityKind::User), 0);
}

// --- Fetch Errors ---

#[test]
fn test_fetch_failures_recorded_not_raised() {
    let engine = Engine::default();
    let sub = repo_column(&engine);

    for error in [
        FetchError::Transport("connection reset".into()),
        FetchError::Auth("bad credentials".into()),
        FetchError::RateLimited { reset_at: None },
    ] {
        let outcome = sync_once(&engine, failing(error.clone()), &sub, TIMEOUT).unwrap();
        assert_eq!(outcome, Some(SyncOutcome::Failed));

        let status = engine.get_subscription_status(&sub).unwrap();
        assert_eq!(status.last_error, Some(error));
        assert_eq!(status.fetched, 0);
    }
}

#[test]
fn test_failure_keeps_previous_data() {
    let engine = Engine::default();
    let sub = repo_column(&engine);

    let ok: Arc<dyn RemoteFetcher> = Arc::new(|_: &FetchRequest| FetchOutcome::Success {
        payload: json!([{"id": "7", "type": "ForkEvent"}]),
        cache: Default::default(),
    });
    sync_once(&engine, ok, &sub, TIMEOUT).unwrap();
    sync_once(&engine, failing(FetchError::Transport("down".into())), &sub, TIMEOUT).unwrap();

    assert_eq!(engine.get_merged_events_for_subscriptions(&[sub.clone()]).len(), 1);
    assert_eq!(engine.get_subscription_status(&sub).unwrap().fetched, 1);
}

#[test]
fn test_garbage_response_is_invalid_payload() {
    let engine = Engine::default();
    let sub = repo_column(&engine);
    let garbage: Arc<dyn RemoteFetcher> = Arc::new(|_: &FetchRequest| FetchOutcome::Success {
        payload: json!("<html>502 Bad Gateway</html>"),
        cache: Default::default(),
    });

    let outcome = sync_once(&engine, garbage, &sub, TIMEOUT).unwrap();
    assert_eq!(outcome, Some(SyncOutcome::Failed));
    assert!(matches!(
        engine.get_subscription_status(&sub).unwrap().last_error,
        Some(FetchError::InvalidPayload(_))
    ));
}

#[test]
fn test_sync_unknown_subscription() {
    let engine = Engine::default();
    let result = sync_once(
        &engine,
        failing(FetchError::Transport("unused".into())),
        &SubscriptionId("nope".into()),
        TIMEOUT,
    );
    assert!(matches!(result, Err(SyncError::SubscriptionNotFound(_))));
}

// --- GC Edge Cases ---

#[test]
fn test_gc_on_empty_engine_is_noop() {
    let engine = Engine::default();
    assert!(engine.collect_garbage().is_empty());
    assert!(engine.collect_garbage().is_empty());
}

// --- Snapshot Errors ---

#[test]
fn test_corrupted_snapshot_file() {
    let dir = TempDir::new().unwrap();
    let storage = FileSnapshotStorage::open(dir.path()).unwrap();
    let engine = Engine::default();
    repo_column(&engine);
    engine.save_to(&storage).unwrap();

    let mut bytes = fs::read(storage.path()).unwrap();
    let last = bytes.len() - 8;
    bytes[last] ^= 0x5a;
    fs::write(storage.path(), &bytes).unwrap();

    let result = Engine::open(EngineConfig::default(), &storage);
    assert!(matches!(result, Err(SyncError::ChecksumMismatch { .. })));
}

#[test]
fn test_truncated_snapshot_file() {
    let dir = TempDir::new().unwrap();
    let storage = FileSnapshotStorage::open(dir.path()).unwrap();
    Engine::default().save_to(&storage).unwrap();

    let bytes = fs::read(storage.path()).unwrap();
    fs::write(storage.path(), &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(storage.load(), Err(SyncError::Corruption(_))));
}

#[test]
fn test_foreign_file_rejected() {
    let dir = TempDir::new().unwrap();
    let storage = FileSnapshotStorage::open(dir.path()).unwrap();
    fs::write(storage.path(), b"definitely not a snapshot file").unwrap();
    assert!(matches!(storage.load(), Err(SyncError::InvalidFormat(_))));
}

#[test]
fn test_storage_locked_by_another_handle() {
    let dir = TempDir::new().unwrap();
    let _held = FileSnapshotStorage::open(dir.path()).unwrap();
    assert!(matches!(
        FileSnapshotStorage::open(dir.path()),
        Err(SyncError::Locked)
    ));
}

#[test]
fn test_memory_storage_starts_empty() {
    let storage = MemorySnapshotStorage::new();
    let engine = Engine::open(EngineConfig::default(), &storage).unwrap();
    assert!(engine.columns().is_empty());
    assert!(storage.saved_len().is_none());
}
