//! The engine: owns all shared state behind a single lock.

use crate::entities::EntityStore;
use crate::error::{FetchError, Result, SyncError};
use crate::events::{sort_newest_first, DisplayEvent, EventMerger, MergeConfig};
use crate::feed::{ChangeFeed, EngineEvent, FeedConfig, FeedHandle};
use crate::gc::{apply_retention, collect_garbage, GcReport, RetentionPolicy};
use crate::normalize::{self, Normalized, Schema};
use crate::persistence::{EngineSnapshot, SnapshotStorage};
use crate::subscriptions::{RegisterOptions, ResourceType, SubscriptionRecord, SubscriptionRegistry};
use crate::sync::{
    ConditionalHeaders, FetchOutcome, FetchRequest, PendingRequests, SchedulerConfig,
    SubscriptionStatus, SyncOutcome, SyncSlot,
};
use crate::tracker::{ItemStatus, ReadTracker};
use crate::types::{
    Column, ColumnId, EntityKind, EntityRef, Params, Payload, SubscriptionId, Timestamp,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Event folding rules for merged-event queries.
    pub merge: MergeConfig,

    /// Kinds the garbage collector may delete.
    /// Default: Event, Notification
    pub gc_kinds: Vec<EntityKind>,

    /// Fetched history kept per subscription; applied on every collection
    /// pass, including the one after a restore.
    pub retention: RetentionPolicy,

    /// Cached merged-event query results.
    /// Default: 64
    pub query_cache_size: usize,

    /// Per-listener change feed buffer.
    /// Default: 1000
    pub feed_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            merge: MergeConfig::default(),
            gc_kinds: vec![EntityKind::Event, EntityKind::Notification],
            retention: RetentionPolicy::default(),
            query_cache_size: 64,
            feed_buffer_size: 1000,
        }
    }
}

/// A subscription requested by a column.
#[derive(Clone, Debug)]
pub struct SubscriptionSpec {
    pub resource: ResourceType,
    pub params: Params,
    pub options: RegisterOptions,
}

impl SubscriptionSpec {
    pub fn new(resource: ResourceType) -> Self {
        Self {
            resource,
            params: Params::new(),
            options: RegisterOptions::default(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Never send conditional headers for this subscription.
    pub fn unconditional(mut self) -> Self {
        self.options.conditional = false;
        self
    }
}

/// A column as announced by the host.
#[derive(Clone, Debug, Default)]
pub struct ColumnSpec {
    /// Generated when absent.
    pub id: Option<ColumnId>,
    pub title: Option<String>,
    pub subscriptions: Vec<SubscriptionSpec>,
}

/// A stored entity with its identity.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: String,
    pub payload: Payload,
}

/// Everything guarded by the engine lock.
#[derive(Default)]
struct EngineState {
    entities: EntityStore,
    registry: SubscriptionRegistry,
    columns: BTreeMap<ColumnId, Column>,
    tracker: ReadTracker,
    sync: BTreeMap<SubscriptionId, SyncSlot>,
    /// Last issued fetch sequence number. Outlives sync slots.
    fetch_seq: u64,
    /// Bumped on every change visible to queries.
    revision: u64,
}

impl EngineState {
    fn bump(&mut self) {
        self.revision += 1;
    }

    fn gc(&mut self, config: &EngineConfig) -> GcReport {
        let trimmed = apply_retention(
            &mut self.registry,
            &self.entities,
            &self.tracker,
            &config.retention,
            Timestamp::now(),
        );
        let mut report = collect_garbage(&self.columns, &mut self.registry, &mut self.entities, &config.gc_kinds);
        report.fetched_trimmed = trimmed;
        for id in &report.subscriptions_removed {
            self.sync.remove(id);
        }
        for entity in &report.entities_removed {
            self.tracker.forget(entity);
        }
        if !report.is_empty() {
            self.bump();
        }
        report
    }

    fn status_of(&self, entity: &EntityRef) -> ItemStatus {
        self.tracker.status(entity, self.entities.get_ref(entity))
    }
}

struct CachedQuery {
    revision: u64,
    events: Vec<DisplayEvent>,
}

/// The sync engine.
///
/// Holds the entity store, subscription registry, columns, read tracker and
/// per-subscription sync state behind one mutex, so that every mutation
/// (including a garbage collection pass) is atomic with respect to every
/// other. Share it between the host and a [`crate::Scheduler`] with an `Arc`.
pub struct Engine {
    config: EngineConfig,
    schema: Schema,
    merger: EventMerger,
    state: Mutex<EngineState>,
    query_cache: Mutex<LruCache<Vec<SubscriptionId>, CachedQuery>>,
    feed: ChangeFeed,
    requests: PendingRequests,
    next_column: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.query_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            schema: Schema::activity(),
            merger: EventMerger::new(config.merge.clone()),
            state: Mutex::new(EngineState::default()),
            query_cache: Mutex::new(LruCache::new(cache_size)),
            feed: ChangeFeed::new(config.feed_buffer_size),
            requests: PendingRequests::default(),
            next_column: AtomicU64::new(1),
            config,
        }
    }

    /// Build an engine from the last saved snapshot, if any, and collect
    /// garbage as on application start.
    pub fn open(config: EngineConfig, storage: &dyn SnapshotStorage) -> Result<Self> {
        let engine = Self::new(config);
        match storage.load()? {
            Some(snapshot) => {
                engine.restore(snapshot);
            }
            None => {
                engine.collect_garbage();
            }
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    // --- Columns ---

    /// Register a column and its subscriptions.
    ///
    /// All subscriptions are validated before any is registered. A column
    /// with an existing id has its subscription list replaced.
    pub fn on_column_created(&self, spec: ColumnSpec) -> Result<ColumnId> {
        if spec.subscriptions.is_empty() {
            return Err(SyncError::EmptyColumn);
        }
        for sub in &spec.subscriptions {
            sub.resource.validate(&sub.params)?;
        }

        let id = spec.id.unwrap_or_else(|| self.generate_column_id());
        let mut registered = Vec::new();
        {
            let mut state = self.state.lock();
            let mut subscription_ids = Vec::with_capacity(spec.subscriptions.len());
            for sub in spec.subscriptions {
                let outcome = state.registry.register(sub.resource, sub.params, &sub.options)?;
                if outcome.created {
                    registered.push(outcome.id.clone());
                }
                if !subscription_ids.contains(&outcome.id) {
                    subscription_ids.push(outcome.id);
                }
            }

            state.columns.insert(
                id.clone(),
                Column {
                    id: id.clone(),
                    title: spec.title,
                    subscription_ids,
                    created_at: Timestamp::now(),
                },
            );
            state.bump();
        }

        info!(column = %id, subscriptions = registered.len(), "column created");
        self.feed.publish(EngineEvent::ColumnCreated { id: id.clone() });
        for sub in registered {
            self.feed.publish(EngineEvent::SubscriptionRegistered { id: sub });
        }
        Ok(id)
    }

    /// Remove a column and collect whatever it alone kept alive.
    pub fn on_column_deleted(&self, id: &ColumnId) -> Result<GcReport> {
        let report = {
            let mut state = self.state.lock();
            if state.columns.remove(id).is_none() {
                return Err(SyncError::ColumnNotFound(id.clone()));
            }
            state.bump();
            state.gc(&self.config)
        };

        info!(column = %id, "column deleted");
        self.feed.publish(EngineEvent::ColumnDeleted { id: id.clone() });
        self.publish_gc(&report);
        Ok(report)
    }

    pub fn column(&self, id: &ColumnId) -> Option<Column> {
        self.state.lock().columns.get(id).cloned()
    }

    pub fn columns(&self) -> Vec<Column> {
        self.state.lock().columns.values().cloned().collect()
    }

    pub(crate) fn column_subscriptions(&self, id: &ColumnId) -> Result<Vec<SubscriptionId>> {
        self.state
            .lock()
            .columns
            .get(id)
            .map(|column| column.subscription_ids.clone())
            .ok_or_else(|| SyncError::ColumnNotFound(id.clone()))
    }

    fn generate_column_id(&self) -> ColumnId {
        let n = self.next_column.fetch_add(1, Ordering::SeqCst);
        ColumnId(format!("column-{:x}-{n}", Timestamp::now().0))
    }

    // --- Subscriptions ---

    /// Register a subscription outside any column. It is collected by the
    /// next garbage collection pass unless a column comes to reference it.
    pub fn register_subscription(&self, spec: SubscriptionSpec) -> Result<SubscriptionId> {
        let outcome = {
            let mut state = self.state.lock();
            let outcome = state.registry.register(spec.resource, spec.params, &spec.options)?;
            if outcome.created {
                state.bump();
            }
            outcome
        };
        if outcome.created {
            self.feed.publish(EngineEvent::SubscriptionRegistered {
                id: outcome.id.clone(),
            });
        }
        Ok(outcome.id)
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<SubscriptionRecord> {
        self.state.lock().registry.get(id).cloned()
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.state.lock().registry.ids().into_iter().collect()
    }

    pub fn get_subscription_status(&self, id: &SubscriptionId) -> Result<SubscriptionStatus> {
        let state = self.state.lock();
        let record = state
            .registry
            .get(id)
            .ok_or_else(|| SyncError::SubscriptionNotFound(id.clone()))?;
        let slot = state.sync.get(id).cloned().unwrap_or_default();

        Ok(SubscriptionStatus {
            id: id.clone(),
            state: slot.state,
            last_outcome: slot.last_outcome,
            last_error: slot.last_error,
            updated_at: record.updated_at,
            last_attempt_at: slot.last_attempt_at,
            last_completed_at: slot.last_completed_at,
            fetched: record.fetched.len(),
            rate_limit: record.cache.rate_limit.clone(),
        })
    }

    // --- Entities ---

    /// Normalize a raw payload of `kind` straight into the store.
    pub fn ingest(&self, kind: EntityKind, raw: Value) -> Result<Normalized> {
        let mut state = self.state.lock();
        let normalized = normalize::normalize(&self.schema, &mut state.entities, kind, raw)?;
        state.bump();
        Ok(normalized)
    }

    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<Payload> {
        self.state.lock().entities.get(kind, id).cloned()
    }

    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.state.lock().entities.len_of(kind)
    }

    /// Rebuild `(kind, id)` with its references expanded.
    pub fn denormalize(&self, kind: EntityKind, id: &str) -> Option<Value> {
        let state = self.state.lock();
        normalize::denormalize(&self.schema, &state.entities, kind, id)
    }

    // --- Queries ---

    /// Events fetched by the given subscriptions, newest first, with
    /// compatible runs folded into composites.
    ///
    /// Unknown subscriptions and non-event subscriptions contribute nothing.
    pub fn get_merged_events_for_subscriptions(&self, ids: &[SubscriptionId]) -> Vec<DisplayEvent> {
        let state = self.state.lock();
        let key = ids.to_vec();

        {
            let mut cache = self.query_cache.lock();
            if let Some(cached) = cache.get(&key) {
                if cached.revision == state.revision {
                    return cached.events.clone();
                }
            }
        }

        let mut events: Vec<DisplayEvent> = fetched_entities(&state, ids, EntityKind::Event)
            .map(|(id, payload)| DisplayEvent::from_entity(id, payload.clone()))
            .collect();
        sort_newest_first(&mut events);

        let merged = self.merger.merge_with_status(events, |event| {
            let status = state.status_of(&EntityRef::new(EntityKind::Event, event.id.clone()));
            (status.read, status.archived)
        });

        self.query_cache.lock().put(
            key,
            CachedQuery {
                revision: state.revision,
                events: merged.clone(),
            },
        );
        merged
    }

    /// Notifications fetched by the given subscriptions, most recently
    /// updated first.
    pub fn get_entities_for_notification_subscription(&self, ids: &[SubscriptionId]) -> Vec<Entity> {
        let state = self.state.lock();
        let mut notifications: Vec<Entity> = fetched_entities(&state, ids, EntityKind::Notification)
            .map(|(id, payload)| Entity {
                kind: EntityKind::Notification,
                id: id.to_string(),
                payload: payload.clone(),
            })
            .collect();

        notifications.sort_by(|a, b| {
            match updated_at(&b.payload).cmp(&updated_at(&a.payload)) {
                CmpOrdering::Equal => b.id.cmp(&a.id),
                other => other,
            }
        });
        notifications
    }

    // --- Read tracker ---

    pub fn item_status(&self, item: &EntityRef) -> ItemStatus {
        self.state.lock().status_of(item)
    }

    pub fn mark_read(&self, items: &[EntityRef]) {
        self.track(|tracker, _| tracker.mark_read(items));
    }

    pub fn mark_unread(&self, items: &[EntityRef]) {
        self.track(|tracker, _| tracker.mark_unread(items));
    }

    pub fn toggle_read(&self, items: &[EntityRef]) {
        self.track(|tracker, entities| {
            tracker.toggle_read(items, |item| entities.get_ref(item).cloned())
        });
    }

    pub fn mark_seen(&self, items: &[EntityRef]) {
        self.track(|tracker, _| tracker.mark_seen(items));
    }

    pub fn archive(&self, items: &[EntityRef]) {
        self.track(|tracker, _| tracker.archive(items));
    }

    pub fn unarchive(&self, items: &[EntityRef]) {
        self.track(|tracker, _| tracker.unarchive(items));
    }

    /// Returns the new saved flag.
    pub fn toggle_saved(&self, item: &EntityRef) -> bool {
        self.track(|tracker, _| tracker.toggle_saved(item))
    }

    fn track<T>(&self, f: impl FnOnce(&mut ReadTracker, &EntityStore) -> T) -> T {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let result = f(&mut state.tracker, &state.entities);
        state.bump();
        result
    }

    // --- Garbage collection ---

    /// Run a collection pass now.
    pub fn collect_garbage(&self) -> GcReport {
        let report = self.state.lock().gc(&self.config);
        self.publish_gc(&report);
        report
    }

    fn publish_gc(&self, report: &GcReport) {
        for id in &report.subscriptions_removed {
            self.feed.publish(EngineEvent::SubscriptionUnregistered { id: id.clone() });
        }
        self.feed.publish(EngineEvent::GcCompleted {
            subscriptions_removed: report.subscriptions_removed.len(),
            entities_removed: report.entities_removed.len(),
        });
    }

    // --- Snapshots ---

    /// Full persistent state. Sync status is runtime-only and not included.
    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.lock();
        EngineSnapshot {
            entities: state.entities.clone(),
            subscriptions: state.registry.clone(),
            columns: state.columns.values().cloned().collect(),
            tracker: state.tracker.clone(),
            taken_at: Timestamp::now(),
        }
    }

    /// Replace all state with `snapshot`, then collect garbage.
    pub fn restore(&self, snapshot: EngineSnapshot) -> GcReport {
        let report = {
            let mut state = self.state.lock();
            state.entities = snapshot.entities;
            state.registry = snapshot.subscriptions;
            state.columns = snapshot
                .columns
                .into_iter()
                .map(|column| (column.id.clone(), column))
                .collect();
            state.tracker = snapshot.tracker;
            state.sync.clear();
            state.bump();
            state.gc(&self.config)
        };

        info!(
            subscriptions = self.subscription_ids().len(),
            "restored engine state"
        );
        self.publish_gc(&report);
        report
    }

    pub fn save_to(&self, storage: &dyn SnapshotStorage) -> Result<()> {
        storage.save(&self.snapshot())
    }

    // --- Change feed ---

    pub fn listen(&self, config: FeedConfig) -> FeedHandle {
        self.feed.listen(config)
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // --- Sync plumbing ---

    pub(crate) fn pending_requests(&self) -> &PendingRequests {
        &self.requests
    }

    /// Enter `Fetching` for `id` and build its request. `None` when a fetch
    /// is already in flight.
    pub(crate) fn begin_fetch(&self, id: &SubscriptionId) -> Result<Option<(u64, FetchRequest)>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let record = state
            .registry
            .get(id)
            .ok_or_else(|| SyncError::SubscriptionNotFound(id.clone()))?;

        let seq = state.fetch_seq + 1;
        let slot = state.sync.entry(id.clone()).or_default();
        if !slot.begin(seq, Timestamp::now()) {
            return Ok(None);
        }
        state.fetch_seq = seq;

        let conditional = if record.conditional {
            ConditionalHeaders::from_cache(&record.cache)
        } else {
            ConditionalHeaders::default()
        };
        let path = match record.resource.path(&record.params) {
            Ok(path) => path,
            Err(e) => {
                slot.state = Default::default();
                return Err(e);
            }
        };

        debug!(subscription = ?id, seq, path = %path, "fetch started");
        Ok(Some((
            seq,
            FetchRequest {
                subscription_id: id.clone(),
                resource: record.resource,
                params: record.params.clone(),
                path,
                conditional,
            },
        )))
    }

    /// Apply a completed fetch. Returns `None` when the result was discarded
    /// (stale, or the subscription is gone).
    pub(crate) fn complete_fetch(
        &self,
        id: &SubscriptionId,
        seq: u64,
        outcome: FetchOutcome,
    ) -> Option<SyncOutcome> {
        let (result, added) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(kind) = state.registry.get(id).map(SubscriptionRecord::entity_kind) else {
                state.sync.remove(id);
                debug!(subscription = ?id, seq, "discarding fetch result for removed subscription");
                return None;
            };
            let slot = state.sync.entry(id.clone()).or_default();
            if !slot.accepts(seq) {
                debug!(subscription = ?id, seq, issued = slot.issued_seq, "discarding stale fetch result");
                return None;
            }

            let (result, error, added) = match outcome {
                FetchOutcome::Success { payload, cache } => {
                    match normalize::normalize(&self.schema, &mut state.entities, kind, payload) {
                        Ok(normalized) => {
                            let ids = normalized.result.ids();
                            match state.registry.record_fetch_result(id, &ids, cache) {
                                Ok(added) => (SyncOutcome::Success, None, added),
                                Err(e) => (
                                    SyncOutcome::Failed,
                                    Some(FetchError::InvalidPayload(e.to_string())),
                                    0,
                                ),
                            }
                        }
                        Err(e) => {
                            warn!(subscription = ?id, error = %e, "fetched payload could not be normalized");
                            (SyncOutcome::Failed, Some(FetchError::InvalidPayload(e.to_string())), 0)
                        }
                    }
                }
                FetchOutcome::Unmodified => (SyncOutcome::Unmodified, None, 0),
                FetchOutcome::Failure(error) => {
                    warn!(subscription = ?id, error = %error, "fetch failed");
                    (SyncOutcome::Failed, Some(error), 0)
                }
            };

            slot.finish(seq, result, error, Timestamp::now());
            if result == SyncOutcome::Success {
                state.bump();
            }
            (result, added)
        };

        debug!(subscription = ?id, seq, outcome = ?result, added, "fetch applied");
        self.feed.publish(EngineEvent::SubscriptionUpdated {
            id: id.clone(),
            outcome: result,
            added,
        });
        Some(result)
    }

    /// Record a refused refresh against an idle subscription.
    pub(crate) fn reject_refresh(&self, id: &SubscriptionId, error: FetchError) {
        let mut state = self.state.lock();
        if state.registry.contains(id) {
            state
                .sync
                .entry(id.clone())
                .or_default()
                .reject(error, Timestamp::now());
        }
    }

    /// Idle subscriptions whose interval has elapsed (or that were never
    /// fetched).
    pub(crate) fn due_subscriptions(&self, now: Timestamp, config: &SchedulerConfig) -> Vec<SubscriptionId> {
        let state = self.state.lock();
        state
            .registry
            .iter()
            .filter(|record| {
                let interval = config.interval_for(&record.cache);
                state
                    .sync
                    .get(&record.id)
                    .map_or(true, |slot| slot.is_due(now, interval))
            })
            .map(|record| record.id.clone())
            .collect()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Stored entities of `kind` fetched by `ids`, deduplicated, in
/// subscription then fetch order.
fn fetched_entities<'a>(
    state: &'a EngineState,
    ids: &'a [SubscriptionId],
    kind: EntityKind,
) -> impl Iterator<Item = (&'a str, &'a Payload)> + 'a {
    let mut seen = HashSet::new();
    ids.iter()
        .filter_map(move |id| state.registry.get(id))
        .filter(move |record| record.entity_kind() == kind)
        .flat_map(|record| record.fetched.iter())
        .filter(move |id| seen.insert((*id).as_str()))
        .filter_map(move |id| state.entities.get(kind, id).map(|payload| (id.as_str(), payload)))
}

fn updated_at(payload: &Payload) -> Option<Timestamp> {
    payload
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(Timestamp::parse)
}
