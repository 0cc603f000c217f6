//! The fixed schema graph of embeddable entities.

use crate::types::{EntityKind, Payload};
use serde_json::Value;
use std::collections::BTreeMap;

/// How one field embeds other entities.
#[derive(Clone, Copy, Debug)]
pub enum Shape {
    /// A single embedded entity.
    One(EntityKind),
    /// An array of embedded entities.
    Many(EntityKind),
    /// An entity whose kind is chosen by a discriminator field inside it.
    Union {
        discriminator: &'static str,
        variants: &'static [(&'static str, EntityKind)],
    },
    /// A plain object (not an entity) whose own fields embed entities.
    Nested(&'static [FieldRule]),
}

#[derive(Clone, Copy, Debug)]
pub struct FieldRule {
    pub field: &'static str,
    pub shape: Shape,
}

impl FieldRule {
    const fn one(field: &'static str, kind: EntityKind) -> Self {
        Self {
            field,
            shape: Shape::One(kind),
        }
    }

    const fn many(field: &'static str, kind: EntityKind) -> Self {
        Self {
            field,
            shape: Shape::Many(kind),
        }
    }
}

const NO_RULES: &[FieldRule] = &[];

const REPOSITORY_RULES: &[FieldRule] = &[
    FieldRule::one("owner", EntityKind::User),
    FieldRule::one("organization", EntityKind::Organization),
];

const ISSUE_RULES: &[FieldRule] = &[
    FieldRule::one("user", EntityKind::User),
    FieldRule::one("assignee", EntityKind::User),
    FieldRule::many("assignees", EntityKind::User),
    FieldRule::one("closed_by", EntityKind::User),
    FieldRule::one("repository", EntityKind::Repository),
];

const PULL_REQUEST_RULES: &[FieldRule] = &[
    FieldRule::one("user", EntityKind::User),
    FieldRule::one("assignee", EntityKind::User),
    FieldRule::many("assignees", EntityKind::User),
    FieldRule::many("requested_reviewers", EntityKind::User),
    FieldRule::one("merged_by", EntityKind::User),
];

const COMMENT_RULES: &[FieldRule] = &[FieldRule::one("user", EntityKind::User)];

const EVENT_PAYLOAD_RULES: &[FieldRule] = &[
    FieldRule::one("comment", EntityKind::Comment),
    FieldRule::one("issue", EntityKind::Issue),
    FieldRule::one("pull_request", EntityKind::PullRequest),
    FieldRule::many("commits", EntityKind::Commit),
    FieldRule::one("repo", EntityKind::Repository),
    FieldRule::one("forkee", EntityKind::Repository),
    FieldRule::one("user", EntityKind::User),
    FieldRule::one("member", EntityKind::User),
];

const EVENT_RULES: &[FieldRule] = &[
    FieldRule::one("actor", EntityKind::User),
    FieldRule::one("org", EntityKind::Organization),
    FieldRule::one("repo", EntityKind::Repository),
    FieldRule {
        field: "payload",
        shape: Shape::Nested(EVENT_PAYLOAD_RULES),
    },
    FieldRule::many("merged", EntityKind::Event),
];

const NOTIFICATION_SUBJECTS: &[(&str, EntityKind)] = &[
    ("Issue", EntityKind::Issue),
    ("PullRequest", EntityKind::PullRequest),
    ("Commit", EntityKind::Commit),
];

const NOTIFICATION_RULES: &[FieldRule] = &[
    FieldRule::one("repository", EntityKind::Repository),
    FieldRule {
        field: "subject",
        shape: Shape::Union {
            discriminator: "type",
            variants: NOTIFICATION_SUBJECTS,
        },
    },
    FieldRule::one("comment", EntityKind::Comment),
];

const SUBSCRIPTION_RULES: &[FieldRule] = &[FieldRule::many("events", EntityKind::Event)];

const COLUMN_RULES: &[FieldRule] = &[FieldRule::many("subscriptions", EntityKind::Subscription)];

/// Field rules per entity kind. Fixed at construction; not extensible at
/// runtime.
#[derive(Clone, Debug)]
pub struct Schema {
    rules: BTreeMap<EntityKind, &'static [FieldRule]>,
}

impl Schema {
    /// The activity-feed schema graph.
    pub fn activity() -> Self {
        let rules = EntityKind::ALL
            .into_iter()
            .map(|kind| {
                let rules = match kind {
                    EntityKind::User | EntityKind::Organization | EntityKind::Commit => NO_RULES,
                    EntityKind::Repository => REPOSITORY_RULES,
                    EntityKind::Issue => ISSUE_RULES,
                    EntityKind::PullRequest => PULL_REQUEST_RULES,
                    EntityKind::Comment => COMMENT_RULES,
                    EntityKind::Event => EVENT_RULES,
                    EntityKind::Notification => NOTIFICATION_RULES,
                    EntityKind::Subscription => SUBSCRIPTION_RULES,
                    EntityKind::Column => COLUMN_RULES,
                };
                (kind, rules)
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self, kind: EntityKind) -> &'static [FieldRule] {
        self.rules.get(&kind).copied().unwrap_or(NO_RULES)
    }

    /// Kinds that embed at least one other entity.
    pub fn composite_kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.rules
            .iter()
            .filter(|(_, rules)| !rules.is_empty())
            .map(|(kind, _)| *kind)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::activity()
    }
}

/// Reference left in place of a tagged-union member.
pub fn reference_object(kind: EntityKind, id: &str) -> Value {
    let mut obj = Payload::new();
    obj.insert("kind".into(), Value::String(kind.as_str().into()));
    obj.insert("id".into(), Value::String(id.into()));
    Value::Object(obj)
}

/// Recognize a value produced by [`reference_object`].
pub fn parse_reference_object(value: &Value) -> Option<(EntityKind, String)> {
    let obj = value.as_object()?;
    if obj.len() != 2 {
        return None;
    }
    let kind = obj.get("kind").and_then(Value::as_str).and_then(EntityKind::from_str_opt)?;
    let id = obj.get("id").and_then(Value::as_str)?;
    Some((kind, id.to_string()))
}
