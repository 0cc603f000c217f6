//! Subscription registry.
//!
//! A subscription is a parameterized remote resource being polled. Its
//! identity is a pure function of the resource type and parameters, so
//! registering the same resource twice yields the same record.

mod registry;
mod resource;

pub use registry::{RegisterOptions, Registered, SubscriptionRecord, SubscriptionRegistry};
pub use resource::ResourceType;
