//! Display-time folding of related events.

mod merger;

pub use merger::{member_ids, sort_newest_first, DisplayEvent, EventMerger, MergeConfig};
