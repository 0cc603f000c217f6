//! Keyed-by-kind, keyed-by-identity entity table.

use super::merge::prefer_newest;
use crate::types::{EntityKind, EntityRef, Payload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What an upsert did to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
    Unchanged,
}

/// Latest known version of every entity.
///
/// Not internally synchronized: the engine guards it together with the
/// subscription registry under one lock.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStore {
    tables: BTreeMap<EntityKind, BTreeMap<String, Payload>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, or merge into the existing record with the prefer-newest rule.
    pub fn upsert(&mut self, kind: EntityKind, id: &str, payload: Payload) -> UpsertOutcome {
        let table = self.tables.entry(kind).or_default();
        match table.get_mut(id) {
            None => {
                table.insert(id.to_string(), payload);
                UpsertOutcome::Inserted
            }
            Some(existing) => {
                let merged = prefer_newest(existing, &payload);
                if merged == *existing {
                    UpsertOutcome::Unchanged
                } else {
                    *existing = merged;
                    UpsertOutcome::Merged
                }
            }
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Payload> {
        self.tables.get(&kind).and_then(|table| table.get(id))
    }

    pub fn get_ref(&self, entity: &EntityRef) -> Option<&Payload> {
        self.get(entity.kind, &entity.id)
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    pub fn delete(&mut self, kind: EntityKind, id: &str) -> Option<Payload> {
        let table = self.tables.get_mut(&kind)?;
        let removed = table.remove(id);
        if table.is_empty() {
            self.tables.remove(&kind);
        }
        removed
    }

    /// All identities stored for `kind`.
    pub fn keys(&self, kind: EntityKind) -> BTreeSet<String> {
        self.tables
            .get(&kind)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len_of(&self, kind: EntityKind) -> usize {
        self.tables.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
