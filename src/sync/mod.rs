//! Polling and on-demand refresh of subscriptions.
//!
//! Each subscription runs the state machine
//! `Idle -> Fetching -> (Success | Unmodified | Failed) -> Idle`. The
//! [`Scheduler`] loop decides when a subscription is fetched; the fetch itself
//! runs on a worker thread and its result is applied through the engine
//! under the engine lock.

mod fetch;
mod scheduler;
mod status;

pub use fetch::{ConditionalHeaders, FetchOutcome, FetchRequest, RemoteFetcher};
pub use scheduler::{sync_once, RefreshTarget, Scheduler};
pub use status::{SubscriptionStatus, SyncOutcome, SyncState};

pub(crate) use fetch::{fetch_with_timeout, PendingRequests};
pub(crate) use status::SyncSlot;

use crate::types::CacheMeta;
use std::time::Duration;

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Interval between scheduled fetches of one subscription.
    /// Default: 60s
    pub poll_interval: Duration,

    /// Bound on a single fetch; a slower fetch fails with a timeout.
    /// Default: 10s
    pub fetch_timeout: Duration,

    /// Max fetches in flight across all subscriptions (None = unlimited).
    pub max_in_flight: Option<usize>,

    /// How often the loop checks for due subscriptions.
    /// Default: 1s
    pub tick: Duration,

    /// Lengthen the interval to the server's X-Poll-Interval when larger.
    pub respect_server_poll_interval: bool,

    /// Whether the session starts authenticated.
    pub start_authenticated: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            max_in_flight: None,
            tick: Duration::from_secs(1),
            respect_server_poll_interval: true,
            start_authenticated: true,
        }
    }
}

impl SchedulerConfig {
    /// Effective interval for a subscription with the given cache metadata.
    /// The server hint can lengthen the interval, never shorten it.
    pub fn interval_for(&self, cache: &CacheMeta) -> Duration {
        match cache.poll_interval_secs {
            Some(secs) if self.respect_server_poll_interval => {
                self.poll_interval.max(Duration::from_secs(secs))
            }
            _ => self.poll_interval,
        }
    }
}
