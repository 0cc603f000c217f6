//! The scheduler loop.

use super::fetch::{fetch_with_timeout, RemoteFetcher};
use super::status::SyncOutcome;
use super::SchedulerConfig;
use crate::engine::Engine;
use crate::error::{FetchError, Result, SyncError};
use crate::feed::{EngineEvent, FeedConfig, FeedFilter, FeedHandle};
use crate::types::{ColumnId, SubscriptionId, Timestamp};
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const MIN_TICK: Duration = Duration::from_millis(10);

/// What a manual refresh applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshTarget {
    Subscription(SubscriptionId),
    /// Every subscription of the column.
    Column(ColumnId),
}

enum Command {
    Refresh(Vec<SubscriptionId>),
    Authenticated(bool),
    Shutdown,
}

/// Handle to the running scheduler loop.
///
/// Dropping the handle shuts the loop down: no new fetches are issued and
/// in-flight ones are allowed to complete or time out.
pub struct Scheduler {
    engine: Arc<Engine>,
    commands: Sender<Command>,
    authenticated: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the scheduler loop.
    pub fn start(
        engine: Arc<Engine>,
        fetcher: Arc<dyn RemoteFetcher>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let (commands, command_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();
        let authenticated = Arc::new(AtomicBool::new(config.start_authenticated));

        let worker = SchedulerLoop {
            feed: listen(&engine),
            engine: Arc::clone(&engine),
            fetcher,
            config,
            authenticated: Arc::clone(&authenticated),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashMap::new(),
            done_tx,
        };

        let handle = thread::Builder::new()
            .name("activity-sync-scheduler".into())
            .spawn(move || worker.run(command_rx, done_rx))?;

        Ok(Self {
            engine,
            commands,
            authenticated,
            handle: Some(handle),
        })
    }

    /// Refresh now, outside the regular interval.
    ///
    /// A subscription already fetching is not fetched twice; the in-flight
    /// result satisfies the request. While signed out nothing is fetched and
    /// an auth failure is recorded instead. Returns the affected
    /// subscriptions.
    pub fn request_refresh(&self, target: RefreshTarget) -> Result<Vec<SubscriptionId>> {
        let ids = match target {
            RefreshTarget::Subscription(id) => {
                if self.engine.subscription(&id).is_none() {
                    return Err(SyncError::SubscriptionNotFound(id));
                }
                vec![id]
            }
            RefreshTarget::Column(id) => self.engine.column_subscriptions(&id)?,
        };

        if !self.is_authenticated() {
            for id in &ids {
                self.engine
                    .reject_refresh(id, FetchError::Auth("session is not authenticated".into()));
            }
            return Ok(ids);
        }

        let _ = self.commands.send(Command::Refresh(ids.clone()));
        Ok(ids)
    }

    /// Suspend polling (signed out) or resume it, refreshing everything.
    pub fn set_authenticated(&self, authenticated: bool) {
        let was = self.authenticated.swap(authenticated, Ordering::SeqCst);
        if was != authenticated {
            let _ = self.commands.send(Command::Authenticated(authenticated));
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for in-flight fetches.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                warn!("scheduler loop panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fetch one subscription on the calling thread and apply the result.
///
/// Returns `None` when the subscription was already fetching (the request is
/// coalesced) or the result was discarded as stale.
pub fn sync_once(
    engine: &Engine,
    fetcher: Arc<dyn RemoteFetcher>,
    id: &SubscriptionId,
    timeout: Duration,
) -> Result<Option<SyncOutcome>> {
    let Some((seq, request)) = engine.begin_fetch(id)? else {
        return Ok(None);
    };
    let outcome = fetch_with_timeout(fetcher, request, timeout, engine.pending_requests());
    Ok(engine.complete_fetch(id, seq, outcome))
}

fn listen(engine: &Engine) -> FeedHandle {
    engine.listen(FeedConfig {
        buffer_size: engine.config().feed_buffer_size,
        filter: FeedFilter {
            include_subscriptions: true,
            ..Default::default()
        },
    })
}

struct SchedulerLoop {
    engine: Arc<Engine>,
    fetcher: Arc<dyn RemoteFetcher>,
    config: SchedulerConfig,
    authenticated: Arc<AtomicBool>,
    feed: FeedHandle,
    /// Subscriptions waiting for a fetch slot, in request order.
    queue: VecDeque<SubscriptionId>,
    queued: HashSet<SubscriptionId>,
    in_flight: HashMap<SubscriptionId, JoinHandle<()>>,
    done_tx: Sender<SubscriptionId>,
}

impl SchedulerLoop {
    fn run(mut self, commands: Receiver<Command>, done: Receiver<SubscriptionId>) {
        info!(
            poll_interval = ?self.config.poll_interval,
            max_in_flight = ?self.config.max_in_flight,
            "scheduler started"
        );

        if self.is_authenticated() {
            let all = self.engine.subscription_ids();
            self.enqueue(all);
            self.dispatch();
        }

        let ticker = tick(self.config.tick.max(MIN_TICK));
        loop {
            let feed = self.feed.receiver.clone();
            let mut resubscribe = false;

            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Refresh(ids)) => self.enqueue(ids),
                    Ok(Command::Authenticated(true)) => {
                        info!("session authenticated; polling resumed");
                        let all = self.engine.subscription_ids();
                        self.enqueue(all);
                    }
                    Ok(Command::Authenticated(false)) => {
                        info!("session signed out; polling suspended");
                        self.queue.clear();
                        self.queued.clear();
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                recv(feed) -> event => match event {
                    Ok(EngineEvent::SubscriptionRegistered { id }) => {
                        if self.is_authenticated() {
                            self.enqueue(vec![id]);
                        }
                    }
                    Ok(EngineEvent::SubscriptionUnregistered { id }) => {
                        if self.queued.remove(&id) {
                            self.queue.retain(|queued| *queued != id);
                        }
                    }
                    Ok(EngineEvent::Dropped { .. }) | Err(_) => resubscribe = true,
                    Ok(_) => {}
                },
                recv(done) -> finished => {
                    if let Ok(id) = finished {
                        self.reap(&id);
                    }
                },
                recv(ticker) -> _ => {
                    if self.is_authenticated() {
                        let due = self.engine.due_subscriptions(Timestamp::now(), &self.config);
                        self.enqueue(due);
                    }
                },
            }

            if resubscribe {
                debug!("scheduler fell behind the change feed; listening again");
                self.engine.feed().unlisten(self.feed.id);
                self.feed = listen(&self.engine);
            }

            self.dispatch();
        }

        self.drain(&done);
        self.engine.feed().unlisten(self.feed.id);
        info!("scheduler stopped");
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn enqueue(&mut self, ids: Vec<SubscriptionId>) {
        for id in ids {
            if self.queued.insert(id.clone()) {
                self.queue.push_back(id);
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.config
            .max_in_flight
            .map_or(true, |max| self.in_flight.len() < max)
    }

    fn dispatch(&mut self) {
        if !self.is_authenticated() {
            return;
        }

        while self.has_capacity() {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&id);

            if self.in_flight.contains_key(&id) {
                debug!(subscription = ?id, "refresh coalesced with in-flight fetch");
                continue;
            }
            if self.engine.pending_requests().contains(&id) {
                debug!(subscription = ?id, "abandoned request still running; not fetching");
                continue;
            }

            match self.engine.begin_fetch(&id) {
                Ok(Some((seq, request))) => self.spawn_fetch(id, seq, request),
                Ok(None) => debug!(subscription = ?id, "refresh coalesced with in-flight fetch"),
                Err(e) => debug!(subscription = ?id, error = %e, "skipping refresh"),
            }
        }
    }

    fn spawn_fetch(&mut self, id: SubscriptionId, seq: u64, request: super::FetchRequest) {
        let engine = Arc::clone(&self.engine);
        let fetcher = Arc::clone(&self.fetcher);
        let done = self.done_tx.clone();
        let timeout = self.config.fetch_timeout;
        let worker_id = id.clone();

        let spawned = thread::Builder::new()
            .name("activity-sync-fetch".into())
            .spawn(move || {
                let outcome = fetch_with_timeout(fetcher, request, timeout, engine.pending_requests());
                engine.complete_fetch(&worker_id, seq, outcome);
                let _ = done.send(worker_id);
            });

        match spawned {
            Ok(handle) => {
                self.in_flight.insert(id, handle);
            }
            Err(e) => {
                warn!(subscription = ?id, error = %e, "could not spawn fetch worker");
                let error = FetchError::Transport(format!("could not spawn fetch worker: {e}"));
                self.engine
                    .complete_fetch(&id, seq, super::FetchOutcome::Failure(error));
            }
        }
    }

    fn reap(&mut self, id: &SubscriptionId) {
        if let Some(handle) = self.in_flight.remove(id) {
            if handle.join().is_err() {
                warn!(subscription = ?id, "fetch worker panicked");
            }
        }
    }

    /// Let in-flight fetches finish; each is bounded by the fetch timeout.
    fn drain(&mut self, done: &Receiver<SubscriptionId>) {
        if !self.in_flight.is_empty() {
            debug!(in_flight = self.in_flight.len(), "waiting for in-flight fetches");
        }
        for (id, handle) in self.in_flight.drain() {
            if handle.join().is_err() {
                warn!(subscription = ?id, "fetch worker panicked");
            }
        }
        while done.try_recv().is_ok() {}
    }
}
