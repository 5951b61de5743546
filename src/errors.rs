use thiserror::Error;

/// Error type for work enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The work record could not be written to the store.
    #[error("failed to persist work: {0}")]
    Storage(#[from] sqlx::Error),
    /// The queue no longer accepts work.
    #[error("the work queue has been shut down")]
    ShutDown,
}

/// A persisted context could not be turned back into a work.
///
/// Records failing with this error are corrupt: the queue drops them instead
/// of retrying them forever.
#[derive(Debug, Error)]
#[error("invalid work context")]
pub struct InvalidContext {
    #[source]
    source: Option<serde_json::Error>,
}

impl InvalidContext {
    /// No context was persisted for a work that requires one.
    pub fn missing() -> Self {
        Self { source: None }
    }
}

impl From<serde_json::Error> for InvalidContext {
    fn from(source: serde_json::Error) -> Self {
        Self {
            source: Some(source),
        }
    }
}

/// A work stopped early because its cancellation was requested.
#[derive(Debug, Error)]
#[error("work was cancelled")]
pub struct Cancelled;
