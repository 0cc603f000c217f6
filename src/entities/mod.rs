//! Entity storage with merge-on-write.
//!
//! Every entity is keyed by `(kind, identity)`. Writes never replace a record
//! wholesale: the incoming version is merged into the stored one with the
//! prefer-newest rule, field by field.

mod merge;
mod store;

pub use merge::{prefer_newest, recency, Recency};
pub use store::{EntityStore, UpsertOutcome};
