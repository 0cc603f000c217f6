//! Broadcasts engine events to in-process listeners.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{DropReason, EngineEvent, FeedConfig, FeedHandle, ListenerId};

struct Listener {
    config: FeedConfig,
    sender: Sender<EngineEvent>,
}

impl Listener {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: EngineEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn wants(&self, event: &EngineEvent) -> bool {
        let filter = &self.config.filter;
        match event {
            EngineEvent::SubscriptionRegistered { .. }
            | EngineEvent::SubscriptionUpdated { .. }
            | EngineEvent::SubscriptionUnregistered { .. } => {
                if !filter.include_subscriptions {
                    return false;
                }
                match (&filter.subscriptions, event.subscription_id()) {
                    (Some(ids), Some(id)) => ids.contains(id),
                    _ => true,
                }
            }
            EngineEvent::ColumnCreated { .. } | EngineEvent::ColumnDeleted { .. } => {
                filter.include_columns
            }
            EngineEvent::GcCompleted { .. } => filter.include_gc,
            EngineEvent::Dropped { .. } => true,
        }
    }
}

/// In-process change feed with bounded, per-listener buffers.
///
/// Listeners that fall behind are dropped rather than blocking the engine.
pub struct ChangeFeed {
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
    default_buffer: usize,
}

impl ChangeFeed {
    pub fn new(default_buffer: usize) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_buffer: default_buffer.max(1),
        }
    }

    /// Add a listener receiving every event.
    pub fn listen_all(&self) -> FeedHandle {
        self.listen(FeedConfig {
            buffer_size: self.default_buffer,
            ..Default::default()
        })
    }

    pub fn listen(&self, config: FeedConfig) -> FeedHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.listeners.write().insert(id, Listener { config, sender });

        FeedHandle { id, receiver }
    }

    pub fn unlisten(&self, id: ListenerId) {
        if let Some(listener) = self.listeners.write().remove(&id) {
            let _ = listener.sender.try_send(EngineEvent::Dropped {
                reason: DropReason::Unlistened,
            });
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every interested listener.
    pub fn publish(&self, event: EngineEvent) {
        let mut overflowed = Vec::new();

        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                if listener.wants(&event) && !listener.try_send(event.clone()) {
                    overflowed.push(*id);
                }
            }
        }

        if !overflowed.is_empty() {
            let mut listeners = self.listeners.write();
            for id in overflowed {
                if let Some(listener) = listeners.remove(&id) {
                    debug!(listener = id.0, "dropping slow change feed listener");
                    let _ = listener.sender.try_send(EngineEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(FeedConfig::default().buffer_size)
    }
}
