//! The remote fetch contract and the bounded timeout race.

use crate::error::FetchError;
use crate::subscriptions::ResourceType;
use crate::types::{CacheMeta, Params, SubscriptionId};
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Cache validators sent with a conditional request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    /// From the last ETag.
    pub if_none_match: Option<String>,
    /// From the last Last-Modified.
    pub if_modified_since: Option<String>,
}

impl ConditionalHeaders {
    pub fn from_cache(cache: &CacheMeta) -> Self {
        Self {
            if_none_match: cache.etag.clone(),
            if_modified_since: cache.last_modified.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }
}

/// One request for a subscription's resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub subscription_id: SubscriptionId,
    pub resource: ResourceType,
    pub params: Params,
    /// Canonical remote path, e.g. `/users/alice/events`.
    pub path: String,
    /// Empty when caching is disabled for the subscription or nothing has
    /// been cached yet.
    pub conditional: ConditionalHeaders,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    /// New data with the validators to send next time.
    Success { payload: Value, cache: CacheMeta },
    /// The server confirmed the cached copy is current.
    Unmodified,
    Failure(FetchError),
}

/// Transport client for the remote API. Attaching credentials is the
/// implementation's concern.
///
/// Each call runs on its own thread and is abandoned, not cancelled, when it
/// exceeds the fetch timeout. Until an abandoned call returns, further
/// requests for the same subscription fail without calling the fetcher, so
/// a hanging remote holds at most one thread per subscription.
/// Implementations should still apply their own socket timeouts.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> FetchOutcome;
}

impl<F> RemoteFetcher for F
where
    F: Fn(&FetchRequest) -> FetchOutcome + Send + Sync,
{
    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        self(request)
    }
}

/// Subscriptions with a request thread still running.
#[derive(Clone, Debug, Default)]
pub(crate) struct PendingRequests(Arc<Mutex<HashSet<SubscriptionId>>>);

impl PendingRequests {
    fn claim(&self, id: &SubscriptionId) -> Option<PendingGuard> {
        if !self.0.lock().insert(id.clone()) {
            return None;
        }
        Some(PendingGuard {
            pending: self.clone(),
            id: id.clone(),
        })
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.0.lock().contains(id)
    }
}

/// Releases the subscription when the request thread ends, panics included.
struct PendingGuard {
    pending: PendingRequests,
    id: SubscriptionId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.0.lock().remove(&self.id);
    }
}

/// Run `fetcher` on its own thread and wait at most `timeout` for it.
///
/// A fetch that loses the race keeps running detached; its late result is
/// dropped with the channel. While it runs, new requests for the same
/// subscription are refused.
pub(crate) fn fetch_with_timeout(
    fetcher: Arc<dyn RemoteFetcher>,
    request: FetchRequest,
    timeout: Duration,
    pending: &PendingRequests,
) -> FetchOutcome {
    let Some(guard) = pending.claim(&request.subscription_id) else {
        warn!(subscription = ?request.subscription_id, "previous request has not returned");
        return FetchOutcome::Failure(FetchError::Transport(
            "previous request for this subscription has not returned".into(),
        ));
    };

    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new()
        .name("activity-sync-request".into())
        .spawn(move || {
            // Declared in this order so an unwinding fetch drops the guard first.
            let tx = tx;
            let guard = guard;
            let outcome = fetcher.fetch(&request);
            // Released before the result is visible to the waiter.
            drop(guard);
            let _ = tx.send(outcome);
        });

    if let Err(e) = spawned {
        warn!(error = %e, "could not spawn request thread");
        return FetchOutcome::Failure(FetchError::Transport(e.to_string()));
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => FetchOutcome::Failure(FetchError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => FetchOutcome::Failure(FetchError::Transport(
            "request ended without a response".into(),
        )),
    }
}
