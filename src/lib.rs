#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod attachment;
mod config;
mod errors;
mod execution;
pub mod memory;
pub mod notification;
mod queue;
mod registry;
/// Database schema definitions.
pub mod schema;
pub mod services;
mod store;
mod util;
mod work;
mod worker;
pub mod works;

/// Configuration of a work queue.
pub use self::config::QueueConfig;
/// Error types.
pub use self::errors::{Cancelled, EnqueueError, InvalidContext};
/// Per-run handle passed to works.
pub use self::execution::Execution;
/// The queue and its lifecycle.
pub use self::queue::{RunHandle, WorkEvent, WorkQueue, WorkQueueBuilder};
/// Type identifier to factory mapping used to restore persisted works.
pub use self::registry::{BoxedWork, WorkRegistry};
/// Persisted record types.
pub use self::schema::{PersistedWork, Priority};
/// Durable storage of pending works.
pub use self::store::WorkStore;
/// The traits every work implements.
pub use self::work::{PersistableWork, Work, WorkState, decode_context, encode_context};
