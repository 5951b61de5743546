#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_matches, assert_none, assert_ok, assert_some, assert_some_eq};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, broadcast};
use work_queue::{
    Cancelled, EnqueueError, Execution, InvalidContext, PersistableWork, PersistedWork, Priority,
    Work, WorkEvent, WorkQueue, WorkQueueBuilder, WorkState, WorkStore, decode_context,
    encode_context,
};

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Create a test queue with common configuration
    pub(super) fn create_test_queue<Env: Clone + Send + Sync + 'static>(
        store: WorkStore,
        env: Env,
    ) -> WorkQueueBuilder<Env> {
        WorkQueue::builder(store, env)
            .num_workers(2)
            .poll_interval(Duration::from_millis(10))
            .jitter(Duration::ZERO)
            .shutdown_when_queue_empty()
    }

    /// Wait for the next event, failing the test if none arrives.
    pub(super) async fn next_event(events: &mut broadcast::Receiver<WorkEvent>) -> WorkEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a work event")
            .expect("event channel closed")
    }

    /// Wait for the first event with `id` that is not `Started`.
    pub(super) async fn outcome(events: &mut broadcast::Receiver<WorkEvent>, id: &str) -> WorkEvent {
        loop {
            let event = next_event(events).await;
            if event.id() == id && event.state() != WorkState::Running {
                return event;
            }
        }
    }
}

/// Ids of the works that ran, in order.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, id: &str) {
        self.0.lock().unwrap().push(id.to_owned());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingWork {
    id: String,
    priority: Priority,
}

impl RecordingWork {
    fn new(id: &str) -> Self {
        Self::with_priority(id, Priority::Medium)
    }

    fn with_priority(id: &str, priority: Priority) -> Self {
        Self {
            id: id.to_owned(),
            priority,
        }
    }
}

impl Work for RecordingWork {
    type Env = Log;

    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn run<'a>(&'a self, log: Log, _execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            log.push(&self.id);
            Ok(())
        }
        .boxed()
    }
}

impl PersistableWork for RecordingWork {
    const TYPE_IDENTIFIER: &'static str = "recording";

    fn context(&self) -> Option<Vec<u8>> {
        encode_context(&self.priority)
    }

    fn restore(id: &str, context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        Ok(Self::with_priority(id, decode_context(context)?))
    }
}

#[tokio::test]
async fn works_are_removed_when_successfully_run() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let log = Log::default();
    let queue = test_utils::create_test_queue(store.clone(), log.clone())
        .register::<RecordingWork>()
        .build();

    let id = assert_some!(queue.enqueue_persistable(RecordingWork::new("a")).await?);
    assert_eq!(id, "a");
    assert_eq!(store.count().await?, 1);
    assert_some_eq!(queue.state("a"), WorkState::Ready);

    let runner = queue.start().await?;
    runner.wait_for_shutdown().await;

    assert_eq!(log.entries(), ["a"]);
    assert_eq!(store.count().await?, 0);
    assert_none!(queue.state("a"));
    assert!(queue.is_empty());

    Ok(())
}

#[tokio::test]
async fn duplicate_ids_are_coalesced() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let log = Log::default();
    let queue = test_utils::create_test_queue(store.clone(), log.clone())
        .register::<RecordingWork>()
        .build();

    assert_some!(queue.enqueue_persistable(RecordingWork::new("same")).await?);
    assert_none!(queue.enqueue_persistable(RecordingWork::new("same")).await?);
    assert_none!(queue.enqueue(RecordingWork::new("same")).await?);
    assert_eq!(store.count().await?, 1);
    assert_eq!(queue.len(), 1);

    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(log.entries(), ["same"]);
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn persisted_works_survive_a_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("works.sqlite");

    {
        let store = WorkStore::open(&path).await?;
        let queue = test_utils::create_test_queue(store.clone(), Log::default())
            .register::<RecordingWork>()
            .build();

        queue
            .enqueue_persistable(RecordingWork::with_priority("survivor", Priority::High))
            .await?;
        // The process dies before the queue is started.
        store.close().await;
    }

    let store = WorkStore::open(&path).await?;
    let record = assert_some!(store.get("survivor").await?);
    assert_eq!(record.type_identifier, "recording");
    assert_eq!(record.priority, Priority::High);

    let log = Log::default();
    let queue = test_utils::create_test_queue(store.clone(), log.clone())
        .register::<RecordingWork>()
        .build();
    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(log.entries(), ["survivor"]);
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn higher_priorities_run_first() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let log = Log::default();
    let queue = test_utils::create_test_queue(store, log.clone())
        .num_workers(1)
        .build();

    queue
        .enqueue(RecordingWork::with_priority("low", Priority::Low))
        .await?;
    queue
        .enqueue(RecordingWork::with_priority("medium-1", Priority::Medium))
        .await?;
    queue
        .enqueue(RecordingWork::with_priority("high", Priority::High))
        .await?;
    queue
        .enqueue(RecordingWork::with_priority("medium-2", Priority::Medium))
        .await?;

    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(log.entries(), ["high", "medium-1", "medium-2", "low"]);

    Ok(())
}

#[tokio::test]
async fn persisted_works_are_loaded_in_priority_order() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    for work in [
        RecordingWork::with_priority("low", Priority::Low),
        RecordingWork::with_priority("high", Priority::High),
        RecordingWork::with_priority("medium", Priority::Medium),
    ] {
        store.put(&work.to_record()).await?;
    }

    let log = Log::default();
    let queue = test_utils::create_test_queue(store, log.clone())
        .num_workers(1)
        .register::<RecordingWork>()
        .build();
    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(log.entries(), ["high", "medium", "low"]);

    Ok(())
}

struct FailingWork {
    id: String,
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl FailingWork {
    fn new(id: &str, failures: usize) -> Self {
        Self {
            id: id.to_owned(),
            failures,
            attempts: Arc::default(),
        }
    }
}

impl Work for FailingWork {
    type Env = ();

    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(&'a self, (): (), execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            assert_eq!(usize::try_from(execution.attempt())?, attempt);
            if attempt < self.failures {
                anyhow::bail!("attempt {attempt} failed");
            }
            Ok(())
        }
        .boxed()
    }
}

impl PersistableWork for FailingWork {
    const TYPE_IDENTIFIER: &'static str = "failing";

    fn context(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore(id: &str, _context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        Ok(Self::new(id, 0))
    }
}

#[tokio::test]
async fn failed_works_keep_their_record() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), ()).build();
    let mut events = queue.subscribe();

    queue
        .enqueue_persistable(FailingWork::new("flaky", usize::MAX))
        .await?;
    queue.start().await?.wait_for_shutdown().await;

    let event = test_utils::outcome(&mut events, "flaky").await;
    assert_eq!(
        event,
        WorkEvent::Failed {
            id: "flaky".into(),
            error: "attempt 0 failed".into()
        }
    );
    assert_some!(store.get("flaky").await?);

    // A later start runs it again.
    let queue = test_utils::create_test_queue(store.clone(), ())
        .register::<FailingWork>()
        .build();
    queue.start().await?.wait_for_shutdown().await;
    assert_none!(store.get("flaky").await?);

    Ok(())
}

#[tokio::test]
async fn failed_works_are_retried_with_backoff() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), ())
        .retry(2, Duration::from_millis(5))
        .build();
    let mut events = queue.subscribe();

    let work = FailingWork::new("retried", 2);
    let attempts = work.attempts.clone();
    queue.enqueue_persistable(work).await?;
    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        test_utils::outcome(&mut events, "retried").await,
        WorkEvent::Finished {
            id: "retried".into()
        }
    );
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn retries_are_bounded() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), ())
        .retry(1, Duration::from_millis(5))
        .build();
    let mut events = queue.subscribe();

    let work = FailingWork::new("hopeless", usize::MAX);
    let attempts = work.attempts.clone();
    queue.enqueue_persistable(work).await?;
    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_matches!(
        test_utils::outcome(&mut events, "hopeless").await,
        WorkEvent::Failed { .. }
    );
    assert_eq!(store.count().await?, 1);

    Ok(())
}

struct PanickingWork;

impl Work for PanickingWork {
    type Env = ();

    fn id(&self) -> &str {
        "panicking"
    }

    fn run<'a>(&'a self, (): (), _execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let reason = "broken invariant";
            if !reason.is_empty() {
                panic!("{reason}");
            }
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test]
async fn panicking_works_fail() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store, ()).build();
    let mut events = queue.subscribe();

    queue.enqueue(PanickingWork).await?;
    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(
        test_utils::outcome(&mut events, "panicking").await,
        WorkEvent::Failed {
            id: "panicking".into(),
            error: "work panicked: broken invariant".into()
        }
    );

    Ok(())
}

#[tokio::test]
async fn pending_works_can_be_cancelled() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let log = Log::default();
    let queue = test_utils::create_test_queue(store.clone(), log.clone())
        .register::<RecordingWork>()
        .build();
    let mut events = queue.subscribe();

    queue
        .enqueue_persistable(RecordingWork::new("doomed"))
        .await?;
    queue.enqueue_persistable(RecordingWork::new("kept")).await?;
    assert!(queue.cancel("doomed").await?);

    assert_eq!(
        test_utils::next_event(&mut events).await,
        WorkEvent::Cancelled {
            id: "doomed".into()
        }
    );
    assert_none!(store.get("doomed").await?);

    queue.start().await?.wait_for_shutdown().await;
    assert_eq!(log.entries(), ["kept"]);

    Ok(())
}

#[tokio::test]
async fn cancelling_unknown_ids_removes_leftover_records() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), Log::default()).build();

    assert!(!queue.cancel("nothing").await?);

    store
        .put(&RecordingWork::new("leftover").to_record())
        .await?;
    assert!(queue.cancel("leftover").await?);
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[derive(Clone)]
struct BarrierEnv {
    started: Arc<Barrier>,
}

struct CancellableWork;

impl Work for CancellableWork {
    type Env = BarrierEnv;

    fn id(&self) -> &str {
        "cancellable"
    }

    fn run<'a>(&'a self, env: BarrierEnv, execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            env.started.wait().await;
            execution.cancelled().await;
            execution.check_cancelled()?;
            Ok(())
        }
        .boxed()
    }
}

impl PersistableWork for CancellableWork {
    const TYPE_IDENTIFIER: &'static str = "cancellable";

    fn context(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore(_id: &str, _context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        Ok(Self)
    }
}

#[tokio::test]
async fn running_works_are_cancelled_cooperatively() -> anyhow::Result<()> {
    let env = BarrierEnv {
        started: Arc::new(Barrier::new(2)),
    };
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), env.clone()).build();
    let mut events = queue.subscribe();

    queue.enqueue_persistable(CancellableWork).await?;
    let runner = queue.start().await?;

    env.started.wait().await;
    assert_some_eq!(queue.state("cancellable"), WorkState::Running);
    assert!(queue.cancel("cancellable").await?);

    runner.wait_for_shutdown().await;

    assert_eq!(
        test_utils::outcome(&mut events, "cancellable").await,
        WorkEvent::Cancelled {
            id: "cancellable".into()
        }
    );
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn works_can_cancel_other_works() -> anyhow::Result<()> {
    struct CancelOther;

    impl Work for CancelOther {
        type Env = BarrierEnv;

        fn id(&self) -> &str {
            "canceller"
        }

        fn run<'a>(&'a self, _env: BarrierEnv, execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
            async move {
                anyhow::ensure!(execution.cancel_work("cancellable").await);
                Ok(())
            }
            .boxed()
        }
    }

    let env = BarrierEnv {
        started: Arc::new(Barrier::new(2)),
    };
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), env.clone()).build();
    let mut events = queue.subscribe();

    queue.enqueue_persistable(CancellableWork).await?;
    let runner = queue.start().await?;
    env.started.wait().await;
    queue.enqueue(CancelOther).await?;

    runner.wait_for_shutdown().await;

    assert_eq!(
        test_utils::outcome(&mut events, "cancellable").await,
        WorkEvent::Cancelled {
            id: "cancellable".into()
        }
    );
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn corrupt_records_are_discarded_and_unknown_types_kept() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    store
        .put(&PersistedWork::new(
            "corrupt",
            RecordingWork::TYPE_IDENTIFIER,
            Some(b"not json".to_vec()),
            Priority::Medium,
        ))
        .await?;
    store
        .put(&PersistedWork::new("alien", "unknown_type", None, Priority::Low))
        .await?;

    let log = Log::default();
    let queue = test_utils::create_test_queue(store.clone(), log.clone())
        .register::<RecordingWork>()
        .build();
    let mut events = queue.subscribe();
    queue.start().await?.wait_for_shutdown().await;

    assert_eq!(
        test_utils::next_event(&mut events).await,
        WorkEvent::Discarded {
            id: "corrupt".into(),
            type_identifier: "recording".into()
        }
    );
    assert!(log.entries().is_empty());
    assert_none!(store.get("corrupt").await?);
    assert_some!(store.get("alien").await?);

    Ok(())
}

struct ProgressWork {
    steps: Mutex<Vec<u32>>,
}

impl Work for ProgressWork {
    type Env = ();

    fn id(&self) -> &str {
        "progress"
    }

    fn run<'a>(&'a self, (): (), execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            for step in 1..=2 {
                self.steps.lock().unwrap().push(step);
                execution.checkpoint(self).await?;
            }
            anyhow::bail!("interrupted after checkpointing")
        }
        .boxed()
    }
}

impl PersistableWork for ProgressWork {
    const TYPE_IDENTIFIER: &'static str = "progress";

    fn context(&self) -> Option<Vec<u8>> {
        encode_context(&*self.steps.lock().unwrap())
    }

    fn restore(_id: &str, context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        Ok(Self {
            steps: Mutex::new(decode_context(context)?),
        })
    }
}

#[tokio::test]
async fn checkpoints_survive_failures() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), ()).build();

    queue
        .enqueue_persistable(ProgressWork {
            steps: Mutex::new(Vec::new()),
        })
        .await?;
    queue.start().await?.wait_for_shutdown().await;

    let record = assert_some!(store.get("progress").await?);
    let restored = assert_ok!(ProgressWork::restore(&record.id, record.context.as_deref()));
    assert_eq!(*restored.steps.lock().unwrap(), [1, 2]);

    Ok(())
}

#[derive(Clone, Default)]
struct HookEnv {
    calls: Arc<AtomicUsize>,
}

struct HookedWork;

impl Work for HookedWork {
    type Env = HookEnv;

    fn id(&self) -> &str {
        "hooked"
    }

    fn run<'a>(&'a self, _env: HookEnv, _execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

impl PersistableWork for HookedWork {
    const TYPE_IDENTIFIER: &'static str = "hooked";

    fn context(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore(_id: &str, _context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        Ok(Self)
    }

    fn persistence_did_complete(&self, env: &HookEnv) {
        env.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn persistence_hook_runs_once_per_enqueue() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let env = HookEnv::default();
    let queue = test_utils::create_test_queue(store.clone(), env.clone())
        .register::<HookedWork>()
        .build();

    queue.enqueue_persistable(HookedWork).await?;
    queue.enqueue_persistable(HookedWork).await?;
    assert_eq!(env.calls.load(Ordering::SeqCst), 1);

    // Reloading a record does not call the hook again.
    let queue = test_utils::create_test_queue(store, env.clone())
        .register::<HookedWork>()
        .build();
    queue.start().await?.wait_for_shutdown().await;
    assert_eq!(env.calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn enqueueing_after_shutdown_fails() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = WorkQueue::builder(store, Log::default()).build();
    let runner = queue.start().await?;

    queue.shutdown();
    runner.wait_for_shutdown().await;

    assert_matches!(
        queue.enqueue(RecordingWork::new("late")).await,
        Err(EnqueueError::ShutDown)
    );

    Ok(())
}

#[tokio::test]
async fn drain_waits_for_running_works() -> anyhow::Result<()> {
    struct SlowWork;

    impl Work for SlowWork {
        type Env = Log;

        fn id(&self) -> &str {
            "slow"
        }

        fn run<'a>(&'a self, log: Log, _execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                log.push("slow");
                Ok(())
            }
            .boxed()
        }
    }

    let store = WorkStore::in_memory().await?;
    let log = Log::default();
    let queue = WorkQueue::builder(store, log.clone())
        .poll_interval(Duration::from_millis(10))
        .build();
    let runner = queue.start().await?;

    queue.enqueue(SlowWork).await?;
    queue.drain().await;
    assert_eq!(log.entries(), ["slow"]);

    queue.shutdown();
    runner.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn drain_returns_after_shutdown_with_queued_works() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = test_utils::create_test_queue(store.clone(), Log::default())
        .register::<RecordingWork>()
        .build();

    queue.enqueue_persistable(RecordingWork::new("a")).await?;
    queue.shutdown();
    queue.start().await?.wait_for_shutdown().await;

    assert_ok!(tokio::time::timeout(Duration::from_secs(5), queue.drain()).await);
    assert!(!queue.is_empty());
    assert_some!(store.get("a").await?);

    Ok(())
}

#[tokio::test]
async fn abandoned_enqueues_release_the_id() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let log = Log::default();
    let queue = test_utils::create_test_queue(store.clone(), log.clone())
        .register::<RecordingWork>()
        .build();

    // Polled once and dropped, usually while the record is being written.
    let mut enqueue = Box::pin(queue.enqueue_persistable(RecordingWork::new("a")));
    let _ = futures_util::poll!(enqueue.as_mut());
    drop(enqueue);

    queue.enqueue_persistable(RecordingWork::new("a")).await?;
    queue.start().await?.wait_for_shutdown().await;

    assert_ok!(tokio::time::timeout(Duration::from_secs(5), queue.drain()).await);
    assert_eq!(log.entries(), ["a"]);
    assert_none!(queue.state("a"));
    assert_eq!(store.count().await?, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_an_enqueue_keeps_queued_works_persisted() -> anyhow::Result<()> {
    let store = WorkStore::in_memory().await?;
    let queue = WorkQueue::builder(store.clone(), Log::default())
        .register::<RecordingWork>()
        .build();

    for _ in 0..200 {
        queue.enqueue_persistable(RecordingWork::new("a")).await?;

        let cancel = tokio::spawn({
            let queue = queue.clone();
            async move { queue.cancel("a").await }
        });
        let enqueue = tokio::spawn({
            let queue = queue.clone();
            async move { queue.enqueue_persistable(RecordingWork::new("a")).await }
        });
        cancel.await??;
        enqueue.await??;

        if queue.state("a").is_some() {
            assert_some!(store.get("a").await?);
        } else {
            assert_none!(store.get("a").await?);
        }

        queue.cancel("a").await?;
        assert_none!(queue.state("a"));
        assert_eq!(store.count().await?, 0);
    }

    Ok(())
}

#[test]
fn cancelled_error_is_displayed() {
    assert_eq!(Cancelled.to_string(), "work was cancelled");
}
