//! Change feed event and listener types.

use crate::sync::SyncOutcome;
use crate::types::{ColumnId, SubscriptionId};
use serde::{Deserialize, Serialize};

/// Configuration for a listener.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Max buffered events before dropping the listener.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: FeedFilter,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: FeedFilter::all(),
        }
    }
}

/// Which engine events a listener receives.
#[derive(Clone, Debug, Default)]
pub struct FeedFilter {
    /// Restrict subscription events to these ids (None = all).
    pub subscriptions: Option<Vec<SubscriptionId>>,

    /// Subscription registered / updated / unregistered.
    pub include_subscriptions: bool,

    /// Column created / deleted.
    pub include_columns: bool,

    /// Garbage collection passes.
    pub include_gc: bool,
}

impl FeedFilter {
    pub fn all() -> Self {
        Self {
            subscriptions: None,
            include_subscriptions: true,
            include_columns: true,
            include_gc: true,
        }
    }

    /// Only events about the given subscriptions.
    pub fn subscriptions(ids: Vec<SubscriptionId>) -> Self {
        Self {
            subscriptions: Some(ids),
            include_subscriptions: true,
            ..Default::default()
        }
    }

    pub fn columns() -> Self {
        Self {
            include_columns: true,
            ..Default::default()
        }
    }
}

/// Something that changed in the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // --- Subscription Events ---
    SubscriptionRegistered {
        id: SubscriptionId,
    },

    /// A fetch for this subscription completed.
    SubscriptionUpdated {
        id: SubscriptionId,
        outcome: SyncOutcome,
        /// Entities new to the subscription.
        added: usize,
    },

    SubscriptionUnregistered {
        id: SubscriptionId,
    },

    // --- Column Events ---
    ColumnCreated {
        id: ColumnId,
    },

    ColumnDeleted {
        id: ColumnId,
    },

    // --- Lifecycle Events ---
    GcCompleted {
        subscriptions_removed: usize,
        entities_removed: usize,
    },

    /// The listener was dropped; no further events follow.
    Dropped {
        reason: DropReason,
    },
}

impl EngineEvent {
    pub(crate) fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            EngineEvent::SubscriptionRegistered { id }
            | EngineEvent::SubscriptionUpdated { id, .. }
            | EngineEvent::SubscriptionUnregistered { id } => Some(id),
            _ => None,
        }
    }
}

/// Why a listener was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly removed.
    Unlistened,
}

/// Identifier of one listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receiving end of a listener.
pub struct FeedHandle {
    pub id: ListenerId,
    pub receiver: crossbeam_channel::Receiver<EngineEvent>,
}

impl FeedHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<EngineEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<EngineEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<EngineEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
