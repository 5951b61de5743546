//! Database schema definitions for SQLx.
//!
//! This module contains the record types stored by the persisted work store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Scheduling priority of a work.
///
/// Higher priorities drain first. Within one priority works run in the
/// order they were enqueued.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[repr(i16)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Housekeeping that can wait, e.g. disk clean-up.
    Low = 0,
    /// The default priority.
    #[default]
    Medium = 1,
    /// User-visible work that should run before anything else.
    High = 2,
}

/// Represents a persisted work record in the database
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PersistedWork {
    /// Identity of the work, unique across the table
    pub id: String,
    /// Registry key used to reconstruct the work after a restart
    pub type_identifier: String,
    /// Opaque snapshot of the work's progress
    pub context: Option<Vec<u8>>,
    /// Priority of the work (higher = more important)
    pub priority: Priority,
    /// Timestamp when the work was first enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl PersistedWork {
    /// Create a record enqueued right now.
    pub fn new(
        id: impl Into<String>,
        type_identifier: impl Into<String>,
        context: Option<Vec<u8>>,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            type_identifier: type_identifier.into(),
            context,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}
