//! Scheduler behavior against a fake remote.

use activity_sync::{
    CacheMeta, ColumnSpec, Engine, FetchError, FetchOutcome, FetchRequest, RefreshTarget,
    RemoteFetcher, ResourceType, Scheduler, SchedulerConfig, SubscriptionId, SubscriptionSpec,
    SyncError, SyncOutcome, SyncState,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Counts calls and concurrency; answers after `delay` with `outcome`.
struct FakeRemote {
    delay: Duration,
    outcome: FetchOutcome,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeRemote {
    fn new(delay: Duration, outcome: FetchOutcome) -> Arc<Self> {
        Arc::new(Self {
            delay,
            outcome,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    fn events() -> FetchOutcome {
        FetchOutcome::Success {
            payload: json!([{
                "id": "1",
                "type": "WatchEvent",
                "created_at": "2017-01-01T00:00:00Z",
                "actor": {"login": "alice"},
                "repo": {"name": "alice/app"},
            }]),
            cache: CacheMeta {
                etag: Some("\"v1\"".into()),
                ..Default::default()
            },
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteFetcher for FakeRemote {
    fn fetch(&self, _request: &FetchRequest) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

fn fast_config() -> SchedulerConfig {
    // Worker logs go to the captured test output.
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    SchedulerConfig {
        tick: Duration::from_millis(10),
        fetch_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn user_column(engine: &Engine, users: &[&str]) -> Vec<SubscriptionId> {
    let column = engine
        .on_column_created(ColumnSpec {
            subscriptions: users
                .iter()
                .map(|user| SubscriptionSpec::new(ResourceType::UserEvents).param("username", *user))
                .collect(),
            ..Default::default()
        })
        .unwrap();
    engine.column(&column).unwrap().subscription_ids
}

fn last_outcome(engine: &Engine, id: &SubscriptionId) -> Option<SyncOutcome> {
    engine.get_subscription_status(id).unwrap().last_outcome
}

// --- Polling ---

#[test]
fn test_new_subscription_fetched_immediately() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::ZERO, FakeRemote::events());
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), fast_config()).unwrap();

    let subs = user_column(&engine, &["alice"]);
    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Success)));

    let events = engine.get_merged_events_for_subscriptions(&subs);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "1");

    // Not due again within the poll interval.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(remote.calls(), 1);
    scheduler.shutdown();
}

#[test]
fn test_existing_subscriptions_fetched_on_start() {
    let engine = Arc::new(Engine::default());
    let subs = user_column(&engine, &["alice", "bob"]);

    let remote = FakeRemote::new(Duration::ZERO, FetchOutcome::Unmodified);
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), fast_config()).unwrap();

    assert!(wait_until(|| subs
        .iter()
        .all(|id| last_outcome(&engine, id) == Some(SyncOutcome::Unmodified))));
    scheduler.shutdown();
}

#[test]
fn test_short_interval_polls_again() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::ZERO, FetchOutcome::Unmodified);
    let config = SchedulerConfig {
        poll_interval: Duration::from_millis(30),
        ..fast_config()
    };
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), config).unwrap();

    user_column(&engine, &["alice"]);
    assert!(wait_until(|| remote.calls() >= 3));
    scheduler.shutdown();
}

// --- Refresh ---

#[test]
fn test_refresh_coalesces_with_in_flight_fetch() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::from_millis(300), FakeRemote::events());
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), fast_config()).unwrap();

    let subs = user_column(&engine, &["alice"]);
    assert!(wait_until(|| engine.get_subscription_status(&subs[0]).unwrap().state == SyncState::Fetching));

    for _ in 0..3 {
        let affected = scheduler
            .request_refresh(RefreshTarget::Subscription(subs[0].clone()))
            .unwrap();
        assert_eq!(affected, subs);
    }

    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Success)));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(remote.calls(), 1);
    scheduler.shutdown();
}

#[test]
fn test_refresh_column_fetches_all_members() {
    let engine = Arc::new(Engine::default());
    let subs = user_column(&engine, &["alice", "bob"]);
    let remote = FakeRemote::new(Duration::ZERO, FetchOutcome::Unmodified);
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), fast_config()).unwrap();
    assert!(wait_until(|| subs.iter().all(|id| last_outcome(&engine, id).is_some())));
    // Let the loop reap the finished workers.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(remote.calls(), 2);

    let column = engine.columns()[0].id.clone();
    let affected = scheduler.request_refresh(RefreshTarget::Column(column)).unwrap();
    assert_eq!(affected, subs);
    assert!(wait_until(|| remote.calls() == 4));
    scheduler.shutdown();
}

#[test]
fn test_refresh_unknown_target() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::ZERO, FetchOutcome::Unmodified);
    let scheduler = Scheduler::start(Arc::clone(&engine), remote, fast_config()).unwrap();

    let missing = SubscriptionId("missing".into());
    assert!(matches!(
        scheduler.request_refresh(RefreshTarget::Subscription(missing)),
        Err(SyncError::SubscriptionNotFound(_))
    ));
    assert!(matches!(
        scheduler.request_refresh(RefreshTarget::Column(activity_sync::ColumnId("nope".into()))),
        Err(SyncError::ColumnNotFound(_))
    ));
    scheduler.shutdown();
}

// --- Failures ---

#[test]
fn test_slow_fetch_times_out() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::from_millis(500), FakeRemote::events());
    let config = SchedulerConfig {
        fetch_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let scheduler = Scheduler::start(Arc::clone(&engine), remote, config).unwrap();

    let subs = user_column(&engine, &["alice"]);
    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Failed)));

    let status = engine.get_subscription_status(&subs[0]).unwrap();
    assert_eq!(status.state, SyncState::Idle);
    assert!(matches!(status.last_error, Some(FetchError::Timeout(_))));
    assert_eq!(engine.entity_count(activity_sync::EntityKind::Event), 0);
    scheduler.shutdown();
}

#[test]
fn test_hung_remote_holds_one_request_per_subscription() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::from_millis(400), FetchOutcome::Unmodified);
    let config = SchedulerConfig {
        fetch_timeout: Duration::from_millis(20),
        poll_interval: Duration::from_millis(20),
        ..fast_config()
    };
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), config).unwrap();

    let subs = user_column(&engine, &["alice"]);
    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Failed)));
    thread::sleep(Duration::from_millis(200));

    assert_eq!(remote.calls(), 1);
    assert_eq!(remote.max_running.load(Ordering::SeqCst), 1);

    // Polling resumes once the abandoned call returns.
    assert!(wait_until(|| remote.calls() >= 2));
    scheduler.shutdown();
}

#[test]
fn test_rate_limited_waits_for_interval() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(
        Duration::ZERO,
        FetchOutcome::Failure(FetchError::RateLimited { reset_at: None }),
    );
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), fast_config()).unwrap();

    let subs = user_column(&engine, &["alice"]);
    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Failed)));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(remote.calls(), 1);
    assert!(matches!(
        engine.get_subscription_status(&subs[0]).unwrap().last_error,
        Some(FetchError::RateLimited { .. })
    ));
    scheduler.shutdown();
}

#[test]
fn test_panicking_remote_does_not_stop_loop() {
    let engine = Arc::new(Engine::default());
    let remote: Arc<dyn RemoteFetcher> = Arc::new(|request: &FetchRequest| -> FetchOutcome {
        if request.path.contains("alice") {
            panic!("remote blew up");
        }
        FetchOutcome::Unmodified
    });
    let scheduler = Scheduler::start(Arc::clone(&engine), remote, fast_config()).unwrap();

    let subs = user_column(&engine, &["alice", "bob"]);
    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Failed)));
    assert!(wait_until(|| last_outcome(&engine, &subs[1]) == Some(SyncOutcome::Unmodified)));
    scheduler.shutdown();
}

// --- Authentication ---

#[test]
fn test_signed_out_suspends_polling() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::ZERO, FetchOutcome::Unmodified);
    let config = SchedulerConfig {
        start_authenticated: false,
        ..fast_config()
    };
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), config).unwrap();

    let subs = user_column(&engine, &["alice"]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(remote.calls(), 0);

    scheduler
        .request_refresh(RefreshTarget::Subscription(subs[0].clone()))
        .unwrap();
    let status = engine.get_subscription_status(&subs[0]).unwrap();
    assert_eq!(status.last_outcome, Some(SyncOutcome::Failed));
    assert!(status.last_error.as_ref().is_some_and(FetchError::is_auth));
    assert_eq!(remote.calls(), 0);

    scheduler.set_authenticated(true);
    assert!(scheduler.is_authenticated());
    assert!(wait_until(|| last_outcome(&engine, &subs[0]) == Some(SyncOutcome::Unmodified)));
    scheduler.shutdown();
}

// --- Limits and Shutdown ---

#[test]
fn test_max_in_flight_respected() {
    let engine = Arc::new(Engine::default());
    let subs = user_column(&engine, &["alice", "bob", "carol", "dave"]);
    let remote = FakeRemote::new(Duration::from_millis(30), FetchOutcome::Unmodified);
    let config = SchedulerConfig {
        max_in_flight: Some(2),
        ..fast_config()
    };
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), config).unwrap();

    assert!(wait_until(|| subs.iter().all(|id| last_outcome(&engine, id).is_some())));
    assert_eq!(remote.calls(), 4);
    assert!(remote.max_running.load(Ordering::SeqCst) <= 2);
    scheduler.shutdown();
}

#[test]
fn test_shutdown_stops_polling() {
    let engine = Arc::new(Engine::default());
    let remote = FakeRemote::new(Duration::ZERO, FetchOutcome::Unmodified);
    let scheduler = Scheduler::start(Arc::clone(&engine), remote.clone(), fast_config()).unwrap();
    scheduler.shutdown();

    user_column(&engine, &["alice"]);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(remote.calls(), 0);
    assert_eq!(engine.feed().listener_count(), 0);
}
