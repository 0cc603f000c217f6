//! Flattening of nested API payloads into the entity store.
//!
//! The walk is driven by an explicit [`Schema`] table mapping each field of
//! each entity kind to the kind (or tagged union of kinds) it embeds:
//! - Sub-objects are normalized bottom-up and replaced by their identity
//! - Tagged unions become `{"kind": .., "id": ..}` reference objects
//! - Re-entry into an entity already being walked returns its reference
//! - Objects whose identity cannot be derived are dropped and counted
//!
//! [`denormalize`] walks the same table in reverse to rebuild nested objects.

mod denormalize;
mod normalizer;
mod preprocess;
mod schema;

pub use denormalize::denormalize;
pub use normalizer::{normalize, Normalized, NormalizedResult};
pub use preprocess::prepare_notification;
pub use schema::{reference_object, parse_reference_object, FieldRule, Schema, Shape};
