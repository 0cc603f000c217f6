//! Change feed for engine state updates.
//!
//! Listeners receive:
//! - Subscription registration, fetch completion and removal
//! - Column creation and deletion
//! - Garbage collection passes
//!
//! Each listener has a bounded buffer; a listener that falls behind is
//! dropped and receives a final [`EngineEvent::Dropped`] when there is room.
//!
//! # Example
//!
//! ```ignore
//! let handle = engine.listen(FeedConfig {
//!     filter: FeedFilter::columns(),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         EngineEvent::ColumnDeleted { id } => println!("column {id} gone"),
//!         EngineEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::ChangeFeed;
pub use types::{DropReason, EngineEvent, FeedConfig, FeedFilter, FeedHandle, ListenerId};
