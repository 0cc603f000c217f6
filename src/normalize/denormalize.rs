//! Rebuild nested objects from normalized entities.

use super::schema::{parse_reference_object, FieldRule, Schema, Shape};
use crate::entities::EntityStore;
use crate::types::{EntityKind, EntityRef, Payload};
use serde_json::Value;
use std::collections::HashSet;

/// Rebuild the entity `(kind, id)` with its references replaced by the
/// stored entities they point at, recursively.
///
/// References that are missing from the store, or that would re-enter an
/// entity already being rebuilt, are left as bare identities.
pub fn denormalize(schema: &Schema, store: &EntityStore, kind: EntityKind, id: &str) -> Option<Value> {
    store.get(kind, id)?;
    let mut visiting = HashSet::new();
    Some(entity(schema, store, kind, id, &mut visiting))
}

fn entity(
    schema: &Schema,
    store: &EntityStore,
    kind: EntityKind,
    id: &str,
    visiting: &mut HashSet<EntityRef>,
) -> Value {
    let key = EntityRef::new(kind, id);
    let Some(payload) = store.get(kind, id) else {
        return Value::String(id.to_string());
    };
    if !visiting.insert(key.clone()) {
        return Value::String(id.to_string());
    }

    let mut obj = payload.clone();
    expand(schema, store, schema.rules(kind), &mut obj, visiting);
    visiting.remove(&key);
    Value::Object(obj)
}

fn expand(
    schema: &Schema,
    store: &EntityStore,
    rules: &[FieldRule],
    obj: &mut Payload,
    visiting: &mut HashSet<EntityRef>,
) {
    for rule in rules {
        let Some(value) = obj.get_mut(rule.field) else {
            continue;
        };

        match (rule.shape, value) {
            (Shape::One(kind), value) => {
                if let Some(id) = value.as_str().map(str::to_string) {
                    *value = entity(schema, store, kind, &id, visiting);
                }
            }
            (Shape::Many(kind), Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Value::String(id) = item {
                        let id = id.clone();
                        *item = entity(schema, store, kind, &id, visiting);
                    }
                }
            }
            (Shape::Union { .. }, value) => {
                if let Some((kind, id)) = parse_reference_object(value) {
                    *value = entity(schema, store, kind, &id, visiting);
                }
            }
            (Shape::Nested(inner), Value::Object(nested)) => {
                expand(schema, store, inner, nested, visiting);
            }
            _ => {}
        }
    }
}
