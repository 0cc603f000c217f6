//! Reachability-based garbage collection.
//!
//! Columns are the roots. A pass first unregisters every subscription no
//! column references, then deletes every entity of a collectible kind that
//! no remaining subscription has fetched. Reference kinds (users,
//! repositories, ...) are never collected.
//!
//! The engine trims each subscription's fetched history with
//! [`apply_retention`] before a pass, so old items become unreachable.

use crate::entities::EntityStore;
use crate::subscriptions::SubscriptionRegistry;
use crate::tracker::ReadTracker;
use crate::types::{Column, ColumnId, EntityKind, EntityRef, Payload, SubscriptionId, Timestamp};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use tracing::{debug, info};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How much fetched history each subscription keeps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Items older than this are dropped. Items without a timestamp never
    /// count as old.
    /// Default: 7 days
    pub max_age: Option<Duration>,

    /// Newest items kept per subscription.
    /// Default: 50
    pub max_items: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(7 * DAY),
            max_items: Some(50),
        }
    }
}

impl RetentionPolicy {
    /// Never trim.
    pub fn keep_all() -> Self {
        Self {
            max_age: None,
            max_items: None,
        }
    }
}

/// What one pass removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub subscriptions_removed: Vec<SubscriptionId>,
    pub entities_removed: Vec<EntityRef>,
    /// Fetched ids dropped from live subscriptions by the retention policy.
    pub fetched_trimmed: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.subscriptions_removed.is_empty()
            && self.entities_removed.is_empty()
            && self.fetched_trimmed == 0
    }
}

/// Trim every subscription's fetched list to `policy`.
///
/// Items are ranked newest first. Saved items are always kept but still
/// count toward `max_items`. Ids whose entity is no longer stored are
/// dropped. Returns the number of ids removed.
pub fn apply_retention(
    registry: &mut SubscriptionRegistry,
    store: &EntityStore,
    tracker: &ReadTracker,
    policy: &RetentionPolicy,
    now: Timestamp,
) -> usize {
    let cutoff = policy.max_age.map(|age| now.saturating_sub(age));
    let mut plans = Vec::new();

    for record in registry.iter() {
        let kind = record.entity_kind();
        let mut ranked: Vec<(&str, Option<Timestamp>, bool)> = Vec::with_capacity(record.fetched.len());
        for id in &record.fetched {
            let Some(payload) = store.get(kind, id) else {
                continue;
            };
            let saved = tracker
                .marks(&EntityRef::new(kind, id.clone()))
                .is_some_and(|marks| marks.saved);
            ranked.push((id.as_str(), item_time(kind, payload), saved));
        }
        // Stable, so equal times keep fetch order.
        ranked.sort_by_key(|(_, time, _)| Reverse(*time));

        let mut keep = HashSet::new();
        let mut count = 0;
        for (id, time, saved) in ranked {
            let fresh = match (cutoff, time) {
                (Some(cutoff), Some(time)) => time >= cutoff,
                _ => true,
            };
            if !saved && !fresh {
                continue;
            }
            count += 1;
            if saved || policy.max_items.map_or(true, |max| count <= max) {
                keep.insert(id.to_string());
            }
        }

        if keep.len() < record.fetched.len() {
            plans.push((record.id.clone(), keep));
        }
    }

    let mut trimmed = 0;
    for (id, keep) in plans {
        let dropped = registry.retain_fetched(&id, |entity_id| keep.contains(entity_id));
        if dropped > 0 {
            debug!(subscription = ?id, dropped, "trimmed fetched history");
        }
        trimmed += dropped;
    }
    trimmed
}

/// Events age by creation; everything else by last update.
fn item_time(kind: EntityKind, payload: &Payload) -> Option<Timestamp> {
    let fields: &[&str] = match kind {
        EntityKind::Event => &["created_at"],
        _ => &["updated_at", "created_at"],
    };
    fields
        .iter()
        .find_map(|field| payload.get(*field).and_then(Value::as_str).and_then(Timestamp::parse))
}

/// Run both phases. Empty inputs are a no-op.
pub fn collect_garbage(
    columns: &BTreeMap<ColumnId, Column>,
    registry: &mut SubscriptionRegistry,
    store: &mut EntityStore,
    kinds: &[EntityKind],
) -> GcReport {
    let mut report = GcReport::default();

    // Phase 1: subscriptions
    let used: BTreeSet<&SubscriptionId> = columns
        .values()
        .flat_map(|column| column.subscription_ids.iter())
        .collect();
    let unused: Vec<SubscriptionId> = registry
        .ids()
        .into_iter()
        .filter(|id| !used.contains(id))
        .collect();
    for id in unused {
        if registry.unregister(&id).is_some() {
            report.subscriptions_removed.push(id);
        }
    }

    // Phase 2: entities
    let reachable: HashSet<EntityRef> = registry
        .iter()
        .flat_map(|record| record.fetched_refs())
        .collect();
    let collectible: BTreeSet<EntityKind> = kinds.iter().copied().collect();
    for kind in collectible {
        for id in store.keys(kind) {
            let entity = EntityRef::new(kind, id);
            if !reachable.contains(&entity) && store.delete(kind, &entity.id).is_some() {
                report.entities_removed.push(entity);
            }
        }
    }

    if !report.is_empty() {
        info!(
            subscriptions = report.subscriptions_removed.len(),
            entities = report.entities_removed.len(),
            "garbage collected"
        );
    }
    report
}
