//! Read / seen / archived / saved marks for displayed items.
//!
//! The engine never consults these marks itself, except to keep the event
//! merger from folding items whose status differs.

use crate::types::{EntityRef, Payload, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Marks recorded against one entity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMarks {
    pub last_read_at: Option<Timestamp>,
    pub last_unread_at: Option<Timestamp>,
    pub seen_at: Option<Timestamp>,
    pub archived_at: Option<Timestamp>,
    pub saved: bool,
}

impl ItemMarks {
    fn is_empty(&self) -> bool {
        *self == ItemMarks::default()
    }
}

/// Derived status of one entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemStatus {
    pub read: bool,
    pub seen: bool,
    pub archived: bool,
    pub saved: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadTracker {
    marks: BTreeMap<EntityRef, ItemMarks>,
}

impl ReadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_read(&mut self, items: &[EntityRef]) {
        let now = Timestamp::now();
        for item in items {
            let marks = self.marks.entry(item.clone()).or_default();
            marks.last_read_at = Some(now);
            marks.last_unread_at = None;
            marks.seen_at.get_or_insert(now);
        }
    }

    pub fn mark_unread(&mut self, items: &[EntityRef]) {
        let now = Timestamp::now();
        for item in items {
            let marks = self.marks.entry(item.clone()).or_default();
            marks.last_unread_at = Some(now);
            marks.last_read_at = None;
        }
    }

    /// Mark all read, unless all already are; then mark all unread.
    pub fn toggle_read(&mut self, items: &[EntityRef], payloads: impl Fn(&EntityRef) -> Option<Payload>) {
        let all_read = items
            .iter()
            .all(|item| self.status(item, payloads(item).as_ref()).read);
        if all_read {
            self.mark_unread(items);
        } else {
            self.mark_read(items);
        }
    }

    pub fn mark_seen(&mut self, items: &[EntityRef]) {
        let now = Timestamp::now();
        for item in items {
            self.marks.entry(item.clone()).or_default().seen_at = Some(now);
        }
    }

    pub fn archive(&mut self, items: &[EntityRef]) {
        let now = Timestamp::now();
        for item in items {
            self.marks.entry(item.clone()).or_default().archived_at = Some(now);
        }
    }

    pub fn unarchive(&mut self, items: &[EntityRef]) {
        for item in items {
            if let Some(marks) = self.marks.get_mut(item) {
                marks.archived_at = None;
            }
        }
        self.prune(items);
    }

    /// Flip the saved flag; returns the new value.
    pub fn toggle_saved(&mut self, item: &EntityRef) -> bool {
        let marks = self.marks.entry(item.clone()).or_default();
        marks.saved = !marks.saved;
        let saved = marks.saved;
        self.prune(std::slice::from_ref(item));
        saved
    }

    /// Status of `item`. `payload` (the stored entity) supplies the remote
    /// `unread` flag and `updated_at`; an entity updated after it was
    /// archived is no longer archived.
    pub fn status(&self, item: &EntityRef, payload: Option<&Payload>) -> ItemStatus {
        let marks = self.marks.get(item);
        let remote_unread = payload.and_then(|p| p.get("unread")).and_then(Value::as_bool);
        let updated_at = payload
            .and_then(|p| p.get("updated_at"))
            .and_then(Value::as_str)
            .and_then(Timestamp::parse);

        let read = match marks {
            Some(m) if m.last_read_at.is_some() => true,
            Some(m) if m.last_unread_at.is_some() => false,
            _ => remote_unread == Some(false),
        };

        let archived = marks
            .and_then(|m| m.archived_at)
            .is_some_and(|archived_at| updated_at.map_or(true, |updated| updated <= archived_at));

        ItemStatus {
            read,
            seen: read || marks.is_some_and(|m| m.seen_at.is_some()),
            archived,
            saved: marks.is_some_and(|m| m.saved),
        }
    }

    pub fn marks(&self, item: &EntityRef) -> Option<&ItemMarks> {
        self.marks.get(item)
    }

    /// Drop every mark for `item`.
    pub fn forget(&mut self, item: &EntityRef) -> bool {
        self.marks.remove(item).is_some()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    fn prune(&mut self, items: &[EntityRef]) {
        for item in items {
            if self.marks.get(item).is_some_and(ItemMarks::is_empty) {
                self.marks.remove(item);
            }
        }
    }
}
