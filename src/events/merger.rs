//! Event merger: collapses consecutive compatible events into composites.

use crate::identity;
use crate::types::{EntityKind, Payload, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

/// Which events may fold together, and how far.
#[derive(Clone, Debug)]
pub struct MergeConfig {
    /// Event types eligible for folding (e.g. "PushEvent").
    pub mergeable_types: BTreeSet<String>,

    /// Max events in one composite (None = unlimited).
    /// Default: 5
    pub max_merged: Option<usize>,

    /// Max distance between the newest events of two folded units.
    /// Default: 24h
    pub window: Option<Duration>,

    /// Only fold events whose read/archived status matches, when a status
    /// lookup is supplied.
    pub require_same_status: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mergeable_types: BTreeSet::from(["PushEvent".to_string()]),
            max_merged: Some(5),
            window: Some(Duration::from_secs(24 * 60 * 60)),
            require_same_status: true,
        }
    }
}

impl MergeConfig {
    pub fn with_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mergeable_types: types.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// One entry of a display list: a single event or a composite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayEvent {
    /// Identity of the primary (most recent) event.
    pub id: String,

    /// Primary display payload, as stored.
    pub event: Payload,

    /// Every folded event, newest first, including the primary. Empty for a
    /// plain event.
    pub merged: Vec<String>,
}

impl DisplayEvent {
    /// Build from a stored event; a stored `merged` list is kept.
    pub fn from_entity(id: impl Into<String>, event: Payload) -> Self {
        let merged = event
            .get("merged")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            id: id.into(),
            event,
            merged,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.merged.len() > 1
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event.get("type").and_then(Value::as_str)
    }

    pub fn created_at(&self) -> Option<Timestamp> {
        self.event
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(Timestamp::parse)
    }

    fn size(&self) -> usize {
        self.merged.len().max(1)
    }

    fn members(&self) -> Vec<String> {
        if self.merged.is_empty() {
            vec![self.id.clone()]
        } else {
            self.merged.clone()
        }
    }

    /// Comparison key for folding: (type, actor, repo).
    fn fold_key(&self) -> Option<(String, String, String)> {
        let event_type = self.event_type()?.to_string();
        let actor = reference_identity(EntityKind::User, self.event.get("actor")?)?;
        let repo = reference_identity(EntityKind::Repository, self.event.get("repo")?)?;
        Some((event_type, actor, repo))
    }
}

/// All event ids represented by `events`, composites expanded.
pub fn member_ids(events: &[DisplayEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    events
        .iter()
        .flat_map(DisplayEvent::members)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Sort by creation time, newest first; ties broken by identity, descending.
pub fn sort_newest_first(events: &mut [DisplayEvent]) {
    events.sort_by(|a, b| match b.created_at().cmp(&a.created_at()) {
        Ordering::Equal => b.id.cmp(&a.id),
        other => other,
    });
}

/// Folds runs of compatible events.
///
/// Two adjacent entries fold when they share type, actor and repository, the
/// type is listed in [`MergeConfig::mergeable_types`], and the size and window
/// limits hold. Each limit only looks at the entries' primary events and
/// sizes, so folding an already folded list changes nothing.
#[derive(Clone, Debug, Default)]
pub struct EventMerger {
    config: MergeConfig,
}

impl EventMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Fold a newest-first list.
    pub fn merge(&self, events: Vec<DisplayEvent>) -> Vec<DisplayEvent> {
        self.merge_with_status(events, |_| ())
    }

    /// Fold a newest-first list, only combining entries whose `status`
    /// matches when [`MergeConfig::require_same_status`] is set.
    pub fn merge_with_status<S, F>(&self, events: Vec<DisplayEvent>, status: F) -> Vec<DisplayEvent>
    where
        S: PartialEq,
        F: Fn(&DisplayEvent) -> S,
    {
        let mut folded: Vec<DisplayEvent> = Vec::with_capacity(events.len());

        for event in events {
            let can_fold = folded
                .last()
                .is_some_and(|last| self.can_fold(last, &event, &status));

            match folded.last_mut() {
                Some(last) if can_fold => fold_into(last, event),
                _ => folded.push(event),
            }
        }

        folded
    }

    fn can_fold<S, F>(&self, head: &DisplayEvent, next: &DisplayEvent, status: &F) -> bool
    where
        S: PartialEq,
        F: Fn(&DisplayEvent) -> S,
    {
        let (Some(head_key), Some(next_key)) = (head.fold_key(), next.fold_key()) else {
            return false;
        };
        if head_key != next_key || !self.config.mergeable_types.contains(&head_key.0) {
            return false;
        }

        if let Some(max) = self.config.max_merged {
            if head.size() + next.size() > max {
                return false;
            }
        }

        if let Some(window) = self.config.window {
            match (head.created_at(), next.created_at()) {
                (Some(a), Some(b)) if a.abs_diff(b) <= window => {}
                _ => return false,
            }
        }

        !self.config.require_same_status || status(head) == status(next)
    }
}

fn fold_into(head: &mut DisplayEvent, next: DisplayEvent) {
    let mut members = head.members();
    let mut seen: HashSet<String> = members.iter().cloned().collect();
    for id in next.members() {
        if seen.insert(id.clone()) {
            members.push(id);
        }
    }
    head.merged = members;
}

/// Identity of a referenced entity, whether normalized (a bare identity) or
/// still embedded.
fn reference_identity(kind: EntityKind, value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(_) => identity::resolve(kind, value).ok(),
        _ => None,
    }
}
