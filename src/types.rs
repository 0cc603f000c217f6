//! Core types shared across the engine.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind-specific fields of an entity. References to other entities are bare
/// identity strings once normalized.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Parameters of a remote resource (e.g. `username`, `owner`, `repo`).
pub type Params = BTreeMap<String, String>;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// Parse an RFC 3339 timestamp as sent by the remote API.
    pub fn parse(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Timestamp(dt.with_timezone(&Utc).timestamp_micros()))
    }

    /// Format as RFC 3339 (UTC, second precision when possible).
    pub fn to_rfc3339(self) -> String {
        match Utc.timestamp_micros(self.0).single() {
            Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            None => String::new(),
        }
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as i64))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as i64))
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(self, other: Timestamp) -> Duration {
        Duration::from_micros(self.0.abs_diff(other.0))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// The closed set of entity kinds the engine understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Organization,
    Repository,
    Event,
    Notification,
    Issue,
    PullRequest,
    Commit,
    Comment,
    Subscription,
    Column,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::User,
        EntityKind::Organization,
        EntityKind::Repository,
        EntityKind::Event,
        EntityKind::Notification,
        EntityKind::Issue,
        EntityKind::PullRequest,
        EntityKind::Commit,
        EntityKind::Comment,
        EntityKind::Subscription,
        EntityKind::Column,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Organization => "organization",
            EntityKind::Repository => "repository",
            EntityKind::Event => "event",
            EntityKind::Notification => "notification",
            EntityKind::Issue => "issue",
            EntityKind::PullRequest => "pull_request",
            EntityKind::Commit => "commit",
            EntityKind::Comment => "comment",
            EntityKind::Subscription => "subscription",
            EntityKind::Column => "column",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed pointer to one stored entity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Deterministic identifier of a subscription (hash of resource type + params).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "SubscriptionId({short}...)")
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application-generated column identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnId(pub String);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user-facing grouping of subscriptions; the root of GC reachability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub title: Option<String>,
    /// Ordered, never empty.
    pub subscription_ids: Vec<SubscriptionId>,
    pub created_at: Timestamp,
}

/// Rate limit figures advertised by the remote API.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<Timestamp>,
}

/// Cache validators and polling hints returned with a response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Minimum poll interval requested by the server (X-Poll-Interval).
    pub poll_interval_secs: Option<u64>,
    pub rate_limit: Option<RateLimit>,
}

impl CacheMeta {
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_parse_roundtrip() {
        let ts = Timestamp::parse("2017-06-01T12:30:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2017-06-01T12:30:00Z");
        assert!(Timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_timestamp_parse_offsets() {
        let utc = Timestamp::parse("2017-06-01T12:30:00Z").unwrap();
        let offset = Timestamp::parse("2017-06-01T14:30:00+02:00").unwrap();
        assert_eq!(utc, offset);
    }

    #[test]
    fn test_entity_kind_names() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_str_opt(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::from_str_opt("release"), None);
    }
}
