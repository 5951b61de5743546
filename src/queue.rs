use crate::config::QueueConfig;
use crate::errors::EnqueueError;
use crate::execution::{CancelWork, Execution};
use crate::registry::{BoxedWork, WorkRegistry};
use crate::schema::{PersistedWork, Priority};
use crate::store::WorkStore;
use crate::work::{PersistableWork, Work, WorkState};
use crate::worker::Worker;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notification published by a [`WorkQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkEvent {
    /// A work has been dispatched to a worker.
    Started {
        /// Id of the work
        id: String,
    },
    /// A work returned without error and its record was removed.
    Finished {
        /// Id of the work
        id: String,
    },
    /// A work failed. Its persisted record, if any, is kept.
    Failed {
        /// Id of the work
        id: String,
        /// The error returned by the work
        error: String,
    },
    /// A work was cancelled and its record was removed.
    Cancelled {
        /// Id of the work
        id: String,
    },
    /// A persisted record could not be restored and was dropped.
    Discarded {
        /// Id of the record
        id: String,
        /// Type identifier of the record
        type_identifier: String,
    },
}

impl WorkEvent {
    /// Id of the work this event is about.
    pub fn id(&self) -> &str {
        match self {
            Self::Started { id }
            | Self::Finished { id }
            | Self::Failed { id, .. }
            | Self::Cancelled { id }
            | Self::Discarded { id, .. } => id,
        }
    }

    /// State of the work after this event.
    pub fn state(&self) -> WorkState {
        match self {
            Self::Started { .. } => WorkState::Running,
            Self::Finished { .. } => WorkState::Finished,
            Self::Failed { .. } | Self::Discarded { .. } => WorkState::Failed,
            Self::Cancelled { .. } => WorkState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    priority: Reverse<Priority>,
    sequence: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// The record is being written.
    Persisting,
    Queued(PendingKey),
    Running,
    /// Failed, waiting for an in-process retry.
    Waiting,
    /// Cancelled or discarded, its record is being deleted.
    Removing,
}

struct Tracked {
    phase: Phase,
    token: CancellationToken,
}

struct Pending<Env> {
    work: BoxedWork<Env>,
    priority: Priority,
    persisted: bool,
    attempt: u32,
}

struct QueueState<Env> {
    pending: BTreeMap<PendingKey, Pending<Env>>,
    tracked: HashMap<String, Tracked>,
}

/// A work handed to a worker.
pub(crate) struct Dispatch<Env> {
    pub(crate) work: BoxedWork<Env>,
    pub(crate) execution: Execution,
    priority: Priority,
    persisted: bool,
}

pub(crate) struct Shared<Env> {
    pub(crate) store: WorkStore,
    pub(crate) env: Env,
    pub(crate) config: QueueConfig,
    pub(crate) wakeup: Notify,
    pub(crate) shutdown: CancellationToken,
    registry: WorkRegistry<Env>,
    state: Mutex<QueueState<Env>>,
    idle: Notify,
    events: broadcast::Sender<WorkEvent>,
    sequence: AtomicU64,
    started: AtomicBool,
}

/// Keeps an id tracked by the queue until dropped.
///
/// Dropping it, e.g. when an enqueue future is abandoned halfway, releases the
/// id. [`Reservation::keep`] hands the id over to the pending map or a retry.
struct Reservation<'a, Env> {
    shared: &'a Shared<Env>,
    id: String,
    token: CancellationToken,
    armed: bool,
}

impl<Env> Reservation<'_, Env> {
    /// Leave the id tracked; whoever picks the work up next releases it.
    fn keep(mut self) {
        self.armed = false;
    }

    /// Stop tracking the id now.
    fn release(mut self) -> String {
        self.armed = false;
        self.shared.release(&self.id);
        std::mem::take(&mut self.id)
    }
}

impl<Env> Drop for Reservation<'_, Env> {
    fn drop(&mut self) {
        if self.armed {
            debug!(work.id = %self.id, "Releasing abandoned work id");
            self.shared.release(&self.id);
        }
    }
}

impl<Env> Shared<Env> {
    fn lock(&self) -> MutexGuard<'_, QueueState<Env>> {
        // The state is only mutated in short non-panicking sections.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.tracked.is_empty()
    }

    /// Whether nothing is left that could still make progress: idle, or shut
    /// down with only queued works left.
    fn is_settled(&self) -> bool {
        let state = self.lock();
        if self.shutdown.is_cancelled() {
            state
                .tracked
                .values()
                .all(|tracked| matches!(tracked.phase, Phase::Queued(_)))
        } else {
            state.pending.is_empty() && state.tracked.is_empty()
        }
    }

    fn release(&self, id: &str) {
        self.lock().tracked.remove(id);
        self.idle.notify_waiters();
    }

    fn set_phase(&self, id: &str, phase: Phase) {
        if let Some(tracked) = self.lock().tracked.get_mut(id) {
            tracked.phase = phase;
        }
    }

    /// Take over an id that is already tracked.
    fn adopt(&self, id: String, token: CancellationToken) -> Reservation<'_, Env> {
        Reservation {
            shared: self,
            id,
            token,
            armed: true,
        }
    }

    /// Start tracking `id`, or return the phase of the work already holding it.
    fn try_reserve(&self, id: &str) -> Result<Reservation<'_, Env>, Phase> {
        let token = {
            let mut state = self.lock();
            if let Some(tracked) = state.tracked.get(id) {
                return Err(tracked.phase);
            }

            let token = CancellationToken::new();
            state.tracked.insert(
                id.to_owned(),
                Tracked {
                    phase: Phase::Persisting,
                    token: token.clone(),
                },
            );
            token
        };
        Ok(self.adopt(id.to_owned(), token))
    }

    /// Reserve `id` for a new work, waiting out a removal of its previous
    /// record. Returns `None` if a work with that id is queued or running.
    async fn reserve(&self, id: &str) -> Option<Reservation<'_, Env>> {
        loop {
            let released = self.idle.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_reserve(id) {
                Ok(reservation) => return Some(reservation),
                Err(Phase::Removing) => released.await,
                Err(_) => return None,
            }
        }
    }

    async fn remove_record(&self, id: &str) {
        if let Err(error) = self.store.remove(id).await {
            error!(work.id = %id, %error, "Failed to remove persisted work record");
        }
    }

    /// Remove the record of a cancelled work, then stop tracking it.
    async fn discard_cancelled(&self, reservation: Reservation<'_, Env>, persisted: bool) {
        self.set_phase(&reservation.id, Phase::Removing);
        if persisted {
            self.remove_record(&reservation.id).await;
        }
        let id = reservation.release();
        self.emit(WorkEvent::Cancelled { id });
    }
}

impl<Env: Clone + Send + Sync + 'static> Shared<Env> {
    /// Make a reserved work dispatchable.
    async fn push(&self, reservation: Reservation<'_, Env>, pending: Pending<Env>) {
        let persisted = pending.persisted;
        let queued = {
            let mut state = self.lock();
            if reservation.token.is_cancelled() {
                false
            } else {
                let key = PendingKey {
                    priority: Reverse(pending.priority),
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                };
                state.pending.insert(key, pending);
                if let Some(tracked) = state.tracked.get_mut(&reservation.id) {
                    tracked.phase = Phase::Queued(key);
                }
                true
            }
        };

        if queued {
            reservation.keep();
            self.wakeup.notify_one();
        } else {
            debug!(work.id = %reservation.id, "Work was cancelled before it was queued");
            self.discard_cancelled(reservation, persisted).await;
        }
    }

    /// Pop the next work in priority order and mark it as running.
    pub(crate) fn take_next(self: &Arc<Self>) -> Option<Dispatch<Env>> {
        let mut state = self.lock();
        let (_, pending) = state.pending.pop_first()?;

        let id = pending.work.id().to_owned();
        let token = match state.tracked.get_mut(&id) {
            Some(tracked) => {
                tracked.phase = Phase::Running;
                tracked.token.clone()
            }
            None => {
                let token = CancellationToken::new();
                state.tracked.insert(
                    id.clone(),
                    Tracked {
                        phase: Phase::Running,
                        token: token.clone(),
                    },
                );
                token
            }
        };
        drop(state);

        self.emit(WorkEvent::Started { id: id.clone() });

        let store = pending.persisted.then(|| self.store.clone());
        let queue: Arc<dyn CancelWork> = self.clone();
        Some(Dispatch {
            work: pending.work,
            execution: Execution::new(id, pending.attempt, token, store, queue),
            priority: pending.priority,
            persisted: pending.persisted,
        })
    }

    /// Record the outcome of a dispatched work.
    pub(crate) async fn complete(self: &Arc<Self>, dispatch: Dispatch<Env>, result: anyhow::Result<()>) {
        let attempt = dispatch.execution.attempt();
        let reservation = self.adopt(
            dispatch.execution.id().to_owned(),
            dispatch.execution.cancellation_token().clone(),
        );

        match result {
            Ok(()) => {
                debug!("Removing successful work…");
                if dispatch.persisted {
                    self.remove_record(&reservation.id).await;
                }
                let id = reservation.release();
                self.emit(WorkEvent::Finished { id });
            }
            Err(error) if reservation.token.is_cancelled() => {
                debug!("Cancelled work returned: {error}");
                self.discard_cancelled(reservation, dispatch.persisted).await;
            }
            Err(error) if attempt < self.config.max_retries && !self.shutdown.is_cancelled() => {
                let delay = self.config.retry_delay(attempt);
                warn!("Failed to run work, retrying in {delay:?}: {error:#}");
                let id = reservation.id.clone();
                let token = reservation.token.clone();
                self.set_phase(&id, Phase::Waiting);
                reservation.keep();
                self.schedule_retry(id, dispatch, token, delay);
            }
            Err(error) => {
                warn!("Failed to run work: {error:#}");
                let id = reservation.release();
                self.emit(WorkEvent::Failed {
                    id,
                    error: format!("{error:#}"),
                });
            }
        }

        self.idle.notify_waiters();
    }

    fn schedule_retry(
        self: &Arc<Self>,
        id: String,
        dispatch: Dispatch<Env>,
        token: CancellationToken,
        delay: Duration,
    ) {
        let shared = Arc::clone(self);
        let pending = Pending {
            work: dispatch.work,
            priority: dispatch.priority,
            persisted: dispatch.persisted,
            attempt: dispatch.execution.attempt() + 1,
        };

        tokio::spawn(async move {
            let reservation = shared.adopt(id, token.clone());
            tokio::select! {
                () = tokio::time::sleep(delay) => shared.push(reservation, pending).await,
                () = token.cancelled() => {
                    shared.discard_cancelled(reservation, pending.persisted).await;
                }
                // The record stays and the work runs again after the next start.
                () = shared.shutdown.cancelled() => {
                    reservation.release();
                }
            }
        });
    }

    async fn restore(&self, record: PersistedWork) {
        let Some(restored) = self.registry.restore(&record) else {
            warn!(
                work.id = %record.id,
                work.type = %record.type_identifier,
                "No work type registered, leaving the record in place"
            );
            return;
        };

        let Ok(reservation) = self.try_reserve(&record.id) else {
            debug!(work.id = %record.id, "Work is already queued");
            return;
        };

        match restored {
            Ok(work) => {
                let pending = Pending {
                    work,
                    priority: record.priority,
                    persisted: true,
                    attempt: 0,
                };
                self.push(reservation, pending).await;
            }
            Err(error) => {
                warn!(
                    work.id = %record.id,
                    work.type = %record.type_identifier,
                    "Dropping persisted work: {error}"
                );
                self.set_phase(&reservation.id, Phase::Removing);
                self.remove_record(&reservation.id).await;
                let id = reservation.release();
                self.emit(WorkEvent::Discarded {
                    id,
                    type_identifier: record.type_identifier,
                });
            }
        }
    }

    async fn cancel(&self, id: &str) -> Result<bool, sqlx::Error> {
        let (token, pending) = {
            let mut state = self.lock();
            let phase = state.tracked.get_mut(id).map(|tracked| {
                tracked.token.cancel();
                let phase = tracked.phase;
                if let Phase::Queued(_) = phase {
                    tracked.phase = Phase::Removing;
                }
                (phase, tracked.token.clone())
            });
            match phase {
                Some((Phase::Queued(key), token)) => (token, state.pending.remove(&key)),
                // The owner of the work cleans up once it notices the token.
                Some(_) => return Ok(true),
                None => {
                    // Held while the leftover record is removed.
                    let token = CancellationToken::new();
                    state.tracked.insert(
                        id.to_owned(),
                        Tracked {
                            phase: Phase::Removing,
                            token: token.clone(),
                        },
                    );
                    (token, None)
                }
            }
        };
        let reservation = self.adopt(id.to_owned(), token);

        let Some(pending) = pending else {
            // Not known in memory, e.g. the record of a failed work.
            let removed = self.store.remove(id).await;
            reservation.release();
            return removed;
        };

        if pending.persisted {
            self.store.remove(id).await?;
        }
        let id = reservation.release();
        self.emit(WorkEvent::Cancelled { id });
        Ok(true)
    }
}

impl<Env: Clone + Send + Sync + 'static> CancelWork for Shared<Env> {
    fn cancel_work<'a>(&'a self, id: &'a str) -> BoxFuture<'a, bool> {
        async move {
            match self.cancel(id).await {
                Ok(found) => found,
                Err(error) => {
                    error!(work.id = %id, %error, "Failed to cancel work");
                    false
                }
            }
        }
        .boxed()
    }
}

/// Builder for a [`WorkQueue`].
pub struct WorkQueueBuilder<Env> {
    store: WorkStore,
    env: Env,
    registry: WorkRegistry<Env>,
    config: QueueConfig,
}

impl<Env: std::fmt::Debug> std::fmt::Debug for WorkQueueBuilder<Env> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueueBuilder")
            .field("registry", &self.registry)
            .field("env", &self.env)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Env: Clone + Send + Sync + 'static> WorkQueueBuilder<Env> {
    /// Replace the whole configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    /// Set how often idle workers look for new work.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Retry failed works in-process up to `max_retries` times, waiting
    /// `delay * 2^attempt` between attempts.
    pub fn retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the queue to shut down when nothing is queued or running.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.config.shutdown_when_queue_empty = true;
        self
    }

    /// Register a persistable work type so its records can be restored.
    pub fn register<W: PersistableWork<Env = Env>>(mut self) -> Self {
        self.registry.register::<W>();
        self
    }

    /// Replace the registry.
    pub fn registry(mut self, registry: WorkRegistry<Env>) -> Self {
        self.registry = registry;
        self
    }

    /// Build the queue. No work runs before [`WorkQueue::start`].
    pub fn build(self) -> WorkQueue<Env> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        WorkQueue {
            shared: Arc::new(Shared {
                store: self.store,
                env: self.env,
                config: self.config,
                wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
                registry: self.registry,
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    tracked: HashMap::new(),
                }),
                idle: Notify::new(),
                events,
                sequence: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
        }
    }
}

/// A durable, prioritized work queue.
///
/// This is a cheap handle: clones share the same queue.
pub struct WorkQueue<Env> {
    shared: Arc<Shared<Env>>,
}

impl<Env> Clone for WorkQueue<Env> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Env> std::fmt::Debug for WorkQueue<Env> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("config", &self.shared.config)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

impl<Env: Clone + Send + Sync + 'static> WorkQueue<Env> {
    /// Create a builder for a queue persisting to `store` and handing `env`
    /// to every work.
    pub fn builder(store: WorkStore, env: Env) -> WorkQueueBuilder<Env> {
        WorkQueueBuilder {
            store,
            env,
            registry: WorkRegistry::default(),
            config: QueueConfig::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared<Env>> {
        Arc::clone(&self.shared)
    }

    /// The store backing this queue.
    pub fn store(&self) -> &WorkStore {
        &self.shared.store
    }

    /// Load persisted works and start the workers.
    ///
    /// Records without a registered type are left untouched; records that fail
    /// to restore are dropped. Calling this more than once has no effect.
    pub async fn start(&self) -> Result<RunHandle, sqlx::Error> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            warn!("Work queue already started");
            return Ok(RunHandle {
                handles: Vec::new(),
            });
        }

        let records = self.shared.store.load_all().await?;
        info!(count = records.len(), "Loaded persisted works");
        for record in records {
            self.shared.restore(record).await;
        }

        let mut handles = Vec::new();
        for i in 1..=self.shared.config.num_workers {
            let name = format!("work-queue-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                shared: Arc::clone(&self.shared),
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        Ok(RunHandle { handles })
    }

    /// Enqueue a work that lives in memory only.
    ///
    /// Returns the work id, or `None` if a work with the same id is already
    /// queued or running.
    #[instrument(name = "work_queue.enqueue", skip_all, fields(work.id = %work.id()))]
    pub async fn enqueue<W: Work<Env = Env>>(&self, work: W) -> Result<Option<String>, EnqueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(EnqueueError::ShutDown);
        }

        let id = work.id().to_owned();
        let Some(reservation) = self.shared.reserve(&id).await else {
            debug!("Work is already queued, coalescing…");
            return Ok(None);
        };

        let pending = Pending {
            priority: work.priority(),
            work: Box::new(work),
            persisted: false,
            attempt: 0,
        };
        self.shared.push(reservation, pending).await;
        Ok(Some(id))
    }

    /// Persist a work, then enqueue it.
    ///
    /// The record is written before the work can be dispatched, and
    /// [`PersistableWork::persistence_did_complete`] is called once it is.
    /// Returns the work id, or `None` if a work with the same id is already
    /// queued or running.
    #[instrument(name = "work_queue.enqueue", skip_all, fields(work.id = %work.id(), work.type_identifier = W::TYPE_IDENTIFIER))]
    pub async fn enqueue_persistable<W: PersistableWork<Env = Env>>(
        &self,
        work: W,
    ) -> Result<Option<String>, EnqueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(EnqueueError::ShutDown);
        }

        let id = work.id().to_owned();
        let Some(reservation) = self.shared.reserve(&id).await else {
            debug!("Work is already queued, coalescing…");
            return Ok(None);
        };

        // Dropping this future before the work is queued releases the id.
        let record = work.to_record();
        self.shared.store.put(&record).await?;

        if !reservation.token.is_cancelled() {
            work.persistence_did_complete(&self.shared.env);
        }

        let pending = Pending {
            work: Box::new(work),
            priority: record.priority,
            persisted: true,
            attempt: 0,
        };
        self.shared.push(reservation, pending).await;
        Ok(Some(id))
    }

    /// Cancel a work.
    ///
    /// A queued work is removed together with its record. A running work has
    /// its cancellation token triggered and its record is removed once it
    /// returns. For an id unknown to the queue any leftover record is removed.
    ///
    /// Returns `true` if anything was found.
    pub async fn cancel(&self, id: &str) -> Result<bool, sqlx::Error> {
        self.shared.cancel(id).await
    }

    /// Current state of a work known to the queue.
    pub fn state(&self, id: &str) -> Option<WorkState> {
        let state = self.shared.lock();
        state.tracked.get(id).map(|tracked| match tracked.phase {
            Phase::Running => WorkState::Running,
            Phase::Persisting | Phase::Queued(_) | Phase::Waiting => WorkState::Ready,
            Phase::Removing => WorkState::Cancelled,
        })
    }

    /// Number of works queued or running.
    pub fn len(&self) -> usize {
        self.shared.lock().tracked.len()
    }

    /// Whether nothing is queued or running.
    pub fn is_empty(&self) -> bool {
        self.shared.is_idle()
    }

    /// Subscribe to lifecycle events of all works.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until nothing is queued or running.
    ///
    /// After [`WorkQueue::shutdown`] queued works are never dispatched, so this
    /// only waits for running works; the queued ones stay in place.
    pub async fn drain(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.shared.is_settled() {
                return;
            }

            tokio::select! {
                () = idle => {}
                () = tokio::time::sleep(self.shared.config.poll_interval()) => {}
            }
        }
    }

    /// Stop dispatching new works.
    ///
    /// Running works are not interrupted; pending works stay persisted and run
    /// after the next start.
    pub fn shutdown(&self) {
        info!("Shutting down the work queue…");
        self.shared.shutdown.cancel();
        self.shared.wakeup.notify_waiters();
        self.shared.idle.notify_waiters();
    }
}

/// Handle to the workers of a started queue
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Work queue worker task panicked");
            }
        });
    }
}
