//! Depth-first flattening walk.

use super::preprocess::prepare_notification;
use super::schema::{parse_reference_object, reference_object, FieldRule, Schema, Shape};
use crate::entities::EntityStore;
use crate::error::{Result, SyncError};
use crate::identity;
use crate::types::{EntityKind, EntityRef, Payload};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Identity (or identities) of the top-level payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizedResult {
    One(String),
    Many(Vec<String>),
}

impl NormalizedResult {
    pub fn ids(&self) -> Vec<String> {
        match self {
            NormalizedResult::One(id) => vec![id.clone()],
            NormalizedResult::Many(ids) => ids.clone(),
        }
    }
}

/// Outcome of normalizing one payload.
#[derive(Clone, Debug)]
pub struct Normalized {
    pub kind: EntityKind,
    pub result: NormalizedResult,
    /// Every entity written, in first-touched order (children before parents).
    pub entities: Vec<EntityRef>,
    /// Sub-objects dropped because their identity could not be derived.
    pub skipped: usize,
}

impl Normalized {
    /// Top-level results as typed references.
    pub fn result_refs(&self) -> Vec<EntityRef> {
        self.result
            .ids()
            .into_iter()
            .map(|id| EntityRef::new(self.kind, id))
            .collect()
    }
}

/// Normalize `raw` (an object or an array of objects of `kind`) into `store`.
///
/// Array elements that cannot be identified are skipped. A single top-level
/// object that cannot be identified is an error, since there is nothing left
/// to return.
pub fn normalize(
    schema: &Schema,
    store: &mut EntityStore,
    kind: EntityKind,
    raw: Value,
) -> Result<Normalized> {
    let mut walk = Walk {
        schema,
        store,
        in_progress: HashSet::new(),
        touched: Vec::new(),
        touched_set: HashSet::new(),
        skipped: 0,
    };

    let result = match raw {
        Value::Array(items) => {
            let mut seen = HashSet::new();
            let ids = items
                .into_iter()
                .filter_map(|item| walk.entity(kind, item))
                .filter(|id| seen.insert(id.clone()))
                .collect();
            NormalizedResult::Many(ids)
        }
        other => {
            let root = identity::resolve(kind, &other)?;
            match walk.entity(kind, other) {
                Some(id) => NormalizedResult::One(id),
                None => {
                    return Err(SyncError::IdentityUnresolvable {
                        kind,
                        reason: format!("root {root} was not stored"),
                    })
                }
            }
        }
    };

    debug!(
        kind = %kind,
        entities = walk.touched.len(),
        skipped = walk.skipped,
        "normalized payload"
    );

    Ok(Normalized {
        kind,
        result,
        entities: walk.touched,
        skipped: walk.skipped,
    })
}

struct Walk<'a> {
    schema: &'a Schema,
    store: &'a mut EntityStore,
    in_progress: HashSet<EntityRef>,
    touched: Vec<EntityRef>,
    touched_set: HashSet<EntityRef>,
    skipped: usize,
}

impl Walk<'_> {
    /// Normalize one embedded entity, returning its identity, or `None` when
    /// it was dropped.
    fn entity(&mut self, kind: EntityKind, raw: Value) -> Option<String> {
        let raw = match raw {
            // Already a reference (re-normalizing a normalized payload).
            Value::String(id) => return Some(id),
            Value::Object(_) if kind == EntityKind::Notification => prepare_notification(raw),
            Value::Object(_) => raw,
            other => {
                warn!(kind = %kind, value = %other, "dropping non-object where entity expected");
                self.skipped += 1;
                return None;
            }
        };

        let id = match identity::resolve(kind, &raw) {
            Ok(id) => id,
            Err(e) => {
                warn!(kind = %kind, error = %e, "dropping sub-object with unresolvable identity");
                self.skipped += 1;
                return None;
            }
        };

        let key = EntityRef::new(kind, id.clone());
        if self.in_progress.contains(&key) {
            return Some(id);
        }

        let Value::Object(mut obj) = raw else {
            return None;
        };

        self.in_progress.insert(key.clone());
        self.apply_rules(self.schema.rules(kind), &mut obj);
        self.store.upsert(kind, &id, obj);
        self.in_progress.remove(&key);

        if self.touched_set.insert(key.clone()) {
            self.touched.push(key);
        }
        Some(id)
    }

    fn apply_rules(&mut self, rules: &'static [FieldRule], obj: &mut Payload) {
        for rule in rules {
            let Some(value) = obj.remove(rule.field) else {
                continue;
            };

            let replacement = match (rule.shape, value) {
                (_, Value::Null) => Some(Value::Null),
                (Shape::One(kind), value) => self.entity(kind, value).map(Value::String),
                (Shape::Many(kind), Value::Array(items)) => Some(Value::Array(
                    items
                        .into_iter()
                        .filter_map(|item| self.entity(kind, item))
                        .map(Value::String)
                        .collect(),
                )),
                (Shape::Many(kind), value) => self.entity(kind, value).map(|id| Value::Array(vec![Value::String(id)])),
                (
                    Shape::Union {
                        discriminator,
                        variants,
                    },
                    value,
                ) => self.union_member(discriminator, variants, value),
                (Shape::Nested(inner), Value::Object(mut nested)) => {
                    self.apply_rules(inner, &mut nested);
                    Some(Value::Object(nested))
                }
                (Shape::Nested(_), value) => Some(value),
            };

            if let Some(replacement) = replacement {
                obj.insert(rule.field.to_string(), replacement);
            }
        }
    }

    fn union_member(
        &mut self,
        discriminator: &str,
        variants: &[(&str, EntityKind)],
        value: Value,
    ) -> Option<Value> {
        if parse_reference_object(&value).is_some() {
            return Some(value);
        }

        let tag = value
            .get(discriminator)
            .and_then(Value::as_str)
            .map(str::to_string);
        let variant = tag
            .as_deref()
            .and_then(|tag| variants.iter().find(|(name, _)| *name == tag))
            .map(|(_, kind)| *kind);

        match variant {
            Some(kind) => self
                .entity(kind, value)
                .map(|id| reference_object(kind, &id)),
            // Unknown variants stay embedded as-is.
            None => Some(value),
        }
    }
}
