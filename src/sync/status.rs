//! Per-subscription sync state.

use crate::error::FetchError;
use crate::types::{RateLimit, SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
}

/// How the last completed fetch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Unmodified,
    Failed,
}

/// Snapshot of one subscription's sync state, for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub id: SubscriptionId,
    pub state: SyncState,
    pub last_outcome: Option<SyncOutcome>,
    /// Error of the last attempt, if it failed.
    pub last_error: Option<FetchError>,
    /// When the subscription's data last changed.
    pub updated_at: Timestamp,
    pub last_attempt_at: Option<Timestamp>,
    pub last_completed_at: Option<Timestamp>,
    /// Number of entities fetched so far.
    pub fetched: usize,
    pub rate_limit: Option<RateLimit>,
}

/// Runtime sync bookkeeping. Not persisted.
#[derive(Clone, Debug, Default)]
pub(crate) struct SyncSlot {
    pub state: SyncState,
    pub last_outcome: Option<SyncOutcome>,
    pub last_error: Option<FetchError>,
    /// Sequence number of the most recently issued fetch.
    pub issued_seq: u64,
    /// Sequence number of the most recently applied completion.
    pub applied_seq: u64,
    pub last_attempt_at: Option<Timestamp>,
    pub last_completed_at: Option<Timestamp>,
}

impl SyncSlot {
    /// Enter `Fetching` under `seq`. False when a fetch is already in flight.
    ///
    /// `seq` comes from an engine-wide counter, so it keeps increasing even
    /// when the slot is dropped and recreated for the same subscription id.
    pub fn begin(&mut self, seq: u64, now: Timestamp) -> bool {
        if self.state == SyncState::Fetching {
            return false;
        }
        self.issued_seq = seq;
        self.state = SyncState::Fetching;
        self.last_attempt_at = Some(now);
        true
    }

    /// Whether a completion for `seq` may still be applied.
    pub fn accepts(&self, seq: u64) -> bool {
        seq == self.issued_seq && seq > self.applied_seq
    }

    pub fn finish(
        &mut self,
        seq: u64,
        outcome: SyncOutcome,
        error: Option<FetchError>,
        now: Timestamp,
    ) {
        self.applied_seq = seq;
        self.state = SyncState::Idle;
        self.last_outcome = Some(outcome);
        self.last_error = error;
        self.last_completed_at = Some(now);
    }

    /// Record a failure without a fetch (e.g. a refresh refused while signed
    /// out). Ignored while a fetch is in flight.
    pub fn reject(&mut self, error: FetchError, now: Timestamp) {
        if self.state == SyncState::Idle {
            self.last_outcome = Some(SyncOutcome::Failed);
            self.last_error = Some(error);
            self.last_completed_at = Some(now);
        }
    }

    /// Idle and not attempted within `interval`.
    pub fn is_due(&self, now: Timestamp, interval: Duration) -> bool {
        if self.state == SyncState::Fetching {
            return false;
        }
        match self.last_attempt_at {
            None => true,
            Some(last) => last.saturating_add(interval) <= now,
        }
    }
}
