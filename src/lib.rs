//! # Activity Sync
//!
//! A normalizing, deduplicating sync engine for paginated activity feeds
//! (events and notifications from a code-hosting API).
//!
//! ## Core Concepts
//!
//! - **Entities**: Raw API payloads split into per-kind stores, one copy per
//!   identity, merged by recency
//! - **Subscriptions**: Canonically identified remote resources, shared
//!   between the columns that request them
//! - **Scheduler**: Periodic and on-demand conditional fetches with
//!   coalescing, timeouts and auth suspension
//! - **Queries**: Newest-first event lists with compatible runs folded into
//!   composite display items
//! - **Garbage collection**: Whatever no column keeps alive is removed
//!
//! ## Example
//!
//! ```ignore
//! use activity_sync::{ColumnSpec, Engine, ResourceType, Scheduler, SchedulerConfig, SubscriptionSpec};
//! use std::sync::Arc;
//!
//! let engine = Arc::new(Engine::default());
//! let column = engine.on_column_created(ColumnSpec {
//!     title: Some("alice".into()),
//!     subscriptions: vec![SubscriptionSpec::new(ResourceType::UserEvents).param("username", "alice")],
//!     ..Default::default()
//! })?;
//!
//! let scheduler = Scheduler::start(Arc::clone(&engine), Arc::new(client), SchedulerConfig::default())?;
//!
//! let ids = engine.column(&column).unwrap().subscription_ids;
//! for event in engine.get_merged_events_for_subscriptions(&ids) {
//!     println!("{} ({} merged)", event.id, event.merged.len());
//! }
//! ```

pub mod engine;
pub mod entities;
pub mod error;
pub mod events;
pub mod feed;
pub mod gc;
pub mod identity;
pub mod normalize;
pub mod persistence;
pub mod subscriptions;
pub mod sync;
pub mod tracker;
pub mod types;

// Re-exports
pub use engine::{ColumnSpec, Engine, EngineConfig, Entity, SubscriptionSpec};
pub use entities::{EntityStore, UpsertOutcome};
pub use error::{FetchError, Result, SyncError};
pub use events::{DisplayEvent, EventMerger, MergeConfig};
pub use feed::{
    ChangeFeed, DropReason, EngineEvent, FeedConfig, FeedFilter, FeedHandle, ListenerId,
};
pub use gc::{GcReport, RetentionPolicy};
pub use normalize::{Normalized, NormalizedResult, Schema};
pub use persistence::{
    EngineSnapshot, FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage,
};
pub use subscriptions::{RegisterOptions, ResourceType, SubscriptionRecord, SubscriptionRegistry};
pub use sync::{
    sync_once, ConditionalHeaders, FetchOutcome, FetchRequest, RefreshTarget, RemoteFetcher,
    Scheduler, SchedulerConfig, SubscriptionStatus, SyncOutcome, SyncState,
};
pub use tracker::{ItemMarks, ItemStatus, ReadTracker};
pub use types::*;
