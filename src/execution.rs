use crate::errors::Cancelled;
use crate::store::WorkStore;
use crate::work::PersistableWork;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Queue operations a running work may call back into.
pub(crate) trait CancelWork: Send + Sync {
    fn cancel_work<'a>(&'a self, id: &'a str) -> BoxFuture<'a, bool>;
}

struct Detached;

impl CancelWork for Detached {
    fn cancel_work<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, bool> {
        async { false }.boxed()
    }
}

/// Handle passed to [`Work::run`](crate::Work::run) for one execution.
///
/// It carries the cooperative cancellation flag and lets a persistable work
/// checkpoint its progress.
pub struct Execution {
    id: String,
    attempt: u32,
    token: CancellationToken,
    store: Option<WorkStore>,
    queue: Arc<dyn CancelWork>,
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.token.is_cancelled())
            .field("persisted", &self.store.is_some())
            .finish()
    }
}

impl Execution {
    pub(crate) fn new(
        id: String,
        attempt: u32,
        token: CancellationToken,
        store: Option<WorkStore>,
        queue: Arc<dyn CancelWork>,
    ) -> Self {
        Self {
            id,
            attempt,
            token,
            store,
            queue,
        }
    }

    /// An execution outside of any queue.
    ///
    /// Checkpoints go to `store` if one is given. Cancelling other works is a
    /// no-op.
    pub fn detached(id: impl Into<String>, store: Option<WorkStore>) -> Self {
        Self::new(
            id.into(),
            0,
            CancellationToken::new(),
            store,
            Arc::new(Detached),
        )
    }

    /// Id of the work being executed.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Zero for the first run, incremented on every in-process retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether cancellation of this work has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once cancellation of this work has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Fail with [`Cancelled`] if cancellation has been requested.
    ///
    /// Meant to be used with `?` between the steps of a long running work.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// The token backing [`Execution::is_cancelled`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Write the current context of `work` to its persisted record.
    ///
    /// Does nothing when the work was not enqueued as persistable, or when its
    /// record has already been removed.
    pub async fn checkpoint<W: PersistableWork>(&self, work: &W) -> Result<(), sqlx::Error> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let context = work.context();
        if store.update(&self.id, context.as_deref()).await? {
            debug!(work.id = %self.id, "Checkpointed work context");
        } else {
            warn!(work.id = %self.id, "No persisted record to checkpoint");
        }
        Ok(())
    }

    /// Cancel another work of the same queue.
    ///
    /// Returns `true` if a queued, running or persisted work was found.
    pub async fn cancel_work(&self, id: &str) -> bool {
        self.queue.cancel_work(id).await
    }
}
