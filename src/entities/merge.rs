//! The prefer-newest merge strategy.

use crate::types::{Payload, Timestamp};
use serde_json::Value;
use std::cmp::Ordering;

/// Which side of a merge carries the more recent version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recency {
    Existing,
    Incoming,
    /// Every timestamp both sides carry is equal.
    Tied,
}

/// Decide which version wins.
///
/// `updated_at` then `created_at` are compared, each only when both sides
/// carry it; the first difference decides. When at least one was compared
/// and all were equal the versions are [`Recency::Tied`]. When neither
/// comparison is possible the incoming version wins (last write by call
/// order).
pub fn recency(existing: &Payload, incoming: &Payload) -> Recency {
    let mut compared = false;
    for field in ["updated_at", "created_at"] {
        if let (Some(a), Some(b)) = (timestamp_field(existing, field), timestamp_field(incoming, field)) {
            match a.cmp(&b) {
                Ordering::Greater => return Recency::Existing,
                Ordering::Less => return Recency::Incoming,
                Ordering::Equal => compared = true,
            }
        }
    }
    if compared {
        Recency::Tied
    } else {
        Recency::Incoming
    }
}

/// Merge two versions of the same entity.
///
/// The result holds the union of both field sets; where both define a field,
/// the newer version's value is kept. A field the winner does not supply is
/// never cleared. Tied versions keep, per field, the value that serializes
/// greater, so the result does not depend on which side arrived first.
pub fn prefer_newest(existing: &Payload, incoming: &Payload) -> Payload {
    let (base, winner) = match recency(existing, incoming) {
        Recency::Incoming => (existing, incoming),
        Recency::Existing => (incoming, existing),
        Recency::Tied => return join(existing, incoming),
    };

    let mut merged = base.clone();
    for (key, value) in winner {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn join(a: &Payload, b: &Payload) -> Payload {
    let mut merged = a.clone();
    for (key, value) in b {
        let replace = match merged.get(key) {
            Some(current) => canonical(value) > canonical(current),
            None => true,
        };
        if replace {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn canonical(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn timestamp_field(payload: &Payload, field: &str) -> Option<Timestamp> {
    payload.get(field).and_then(Value::as_str).and_then(Timestamp::parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_newer_fields_win() {
        let old = payload(json!({"updated_at": "2017-01-01T00:00:00Z", "title": "old", "state": "open"}));
        let new = payload(json!({"updated_at": "2017-01-02T00:00:00Z", "title": "new", "body": "b"}));

        let merged = prefer_newest(&old, &new);
        assert_eq!(merged["title"], "new");
        assert_eq!(merged["body"], "b");
        assert_eq!(merged["state"], "open");
        assert_eq!(merged, prefer_newest(&new, &old));
    }

    #[test]
    fn test_created_at_fallback() {
        let a = payload(json!({"created_at": "2017-01-03T00:00:00Z", "v": 1}));
        let b = payload(json!({"created_at": "2017-01-02T00:00:00Z", "v": 2}));
        assert_eq!(prefer_newest(&a, &b)["v"], 1);
        assert_eq!(prefer_newest(&b, &a)["v"], 1);
    }

    #[test]
    fn test_no_timestamps_last_write_wins() {
        let a = payload(json!({"login": "alice", "avatar_url": "a.png"}));
        let b = payload(json!({"login": "alice", "avatar_url": "b.png"}));
        assert_eq!(prefer_newest(&a, &b)["avatar_url"], "b.png");
        assert_eq!(prefer_newest(&b, &a)["avatar_url"], "a.png");
    }

    #[test]
    fn test_sparser_newer_version_keeps_fields() {
        let full = payload(json!({"updated_at": "2017-01-01T00:00:00Z", "name": "x", "bio": "hi"}));
        let sparse = payload(json!({"updated_at": "2017-02-01T00:00:00Z", "name": "y"}));
        let merged = prefer_newest(&full, &sparse);
        assert_eq!(merged["bio"], "hi");
        assert_eq!(merged["name"], "y");
    }

    #[test]
    fn test_equal_timestamps_are_order_free() {
        let a = payload(json!({"updated_at": "2017-01-02T00:00:00Z", "title": "a", "body": "x"}));
        let b = payload(json!({"updated_at": "2017-01-02T00:00:00Z", "title": "b", "state": "open"}));

        let ab = prefer_newest(&a, &b);
        let ba = prefer_newest(&b, &a);
        assert_eq!(ab, ba);
        assert_eq!(ab["body"], "x");
        assert_eq!(ab["state"], "open");
        assert_eq!(ab["title"], "b");
        assert_eq!(prefer_newest(&ab, &b), ab);
        assert_eq!(prefer_newest(&ab, &a), ab);
        assert_eq!(recency(&a, &b), Recency::Tied);
    }

    #[test]
    fn test_later_field_breaks_tie() {
        let a = payload(json!({"updated_at": "2017-01-02T00:00:00Z", "created_at": "2017-01-01T00:00:00Z"}));
        let b = payload(json!({"updated_at": "2017-01-02T00:00:00Z", "created_at": "2016-12-01T00:00:00Z"}));
        assert_eq!(recency(&a, &b), Recency::Existing);
        assert_eq!(recency(&b, &a), Recency::Incoming);
    }

    #[test]
    fn test_inherited_timestamp_keeps_merge_idempotent() {
        let a = payload(json!({"created_at": "2017-01-05T00:00:00Z", "title": "new"}));
        let b = payload(json!({"updated_at": "2017-01-03T00:00:00Z", "created_at": "2017-01-02T00:00:00Z", "title": "old"}));

        let merged = prefer_newest(&b, &a);
        assert_eq!(merged["title"], "new");
        assert_eq!(prefer_newest(&merged, &b), merged);
        assert_eq!(prefer_newest(&b, &merged), merged);
    }

    #[test]
    fn test_unparseable_timestamps_ignored() {
        let a = payload(json!({"updated_at": "soon", "v": 1}));
        let b = payload(json!({"updated_at": "2017-01-01T00:00:00Z", "v": 2}));
        assert_eq!(recency(&a, &b), Recency::Incoming);
    }
}
