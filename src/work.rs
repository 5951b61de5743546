use crate::errors::InvalidContext;
use crate::execution::Execution;
use crate::schema::{PersistedWork, Priority};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Lifecycle of a work as seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkState {
    /// Waiting to be dispatched.
    Ready,
    /// Currently executing.
    Running,
    /// Returned without error. Terminal.
    Finished,
    /// Returned an error or panicked. Terminal.
    Failed,
    /// Stopped through [`WorkQueue::cancel`](crate::WorkQueue::cancel). Terminal.
    Cancelled,
}

impl WorkState {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

/// A unit of identifiable background work.
///
/// The queue owns a work from enqueue until it reaches a terminal state. A
/// work is never started while another work with the same [`Work::id`] is
/// queued or running.
pub trait Work: Send + Sync + 'static {
    /// The application data provided to this work at runtime.
    type Env: Clone + Send + Sync + 'static;

    /// Identity of the work, used for deduplication.
    ///
    /// This MUST be derived only from the logical parameters of the task, so
    /// that two works doing the same thing share an id.
    fn id(&self) -> &str;

    /// Scheduling priority.
    fn priority(&self) -> Priority {
        Priority::Medium
    }

    /// Human readable name used in logs and error reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Execute the work.
    ///
    /// Returning an error marks the work as failed. Long running works should
    /// check [`Execution::is_cancelled`] between steps.
    fn run<'a>(
        &'a self,
        env: Self::Env,
        execution: &'a Execution,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A work that survives process restarts.
///
/// Enqueueing a persistable work writes a record before the work can be
/// dispatched. After a restart the record is turned back into a work through
/// [`PersistableWork::restore`], looked up by [`PersistableWork::TYPE_IDENTIFIER`].
pub trait PersistableWork: Work + Sized {
    /// Registry key of this work type.
    ///
    /// This MUST be unique for the whole application and stable across releases.
    const TYPE_IDENTIFIER: &'static str;

    /// Snapshot of the current progress.
    ///
    /// This is recomputed every time the record is written, so it must reflect
    /// the latest in-memory state.
    fn context(&self) -> Option<Vec<u8>>;

    /// Rebuild a work from a persisted record.
    ///
    /// The rebuilt work must resume from wherever the previous run stopped.
    fn restore(id: &str, context: Option<&[u8]>) -> Result<Self, InvalidContext>;

    /// Called once the record has been durably written, before the work is
    /// dispatched. Not called for records reloaded after a restart.
    fn persistence_did_complete(&self, _env: &Self::Env) {}

    /// The record describing this work right now.
    fn to_record(&self) -> PersistedWork {
        PersistedWork::new(
            self.id(),
            Self::TYPE_IDENTIFIER,
            self.context(),
            self.priority(),
        )
    }
}

/// Encode a context value as JSON.
///
/// Encoding failures are logged and yield `None`, like an absent context.
pub fn encode_context<T: Serialize + ?Sized>(value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!(%error, "Failed to encode work context");
            None
        }
    }
}

/// Decode a JSON context, failing with [`InvalidContext`] if it is absent or
/// malformed.
pub fn decode_context<T: DeserializeOwned>(context: Option<&[u8]>) -> Result<T, InvalidContext> {
    let bytes = context.ok_or_else(InvalidContext::missing)?;
    Ok(serde_json::from_slice(bytes)?)
}
