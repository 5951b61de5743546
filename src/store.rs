use crate::schema::PersistedWork;
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, instrument};

/// Durable storage for pending works.
///
/// Records are keyed by work id, so at most one record exists per logical task.
/// The underlying pool holds a single connection: every read and write is
/// serialized, and every operation is a single atomic statement.
#[derive(Debug, Clone)]
pub struct WorkStore {
    pool: SqlitePool,
}

impl WorkStore {
    /// Open (or create) the store at `path` and run pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        Self::connect(options).await
    }

    /// Open a private in-memory store. Nothing survives dropping it.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        Self::connect(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, sqlx::Error> {
        // An idle connection must never be reaped: the in-memory database
        // lives exactly as long as its only connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Insert a record, or overwrite the type, context and priority of the
    /// record with the same id. The original `enqueued_at` is kept.
    #[instrument(name = "store.put", skip_all, fields(work.id = %record.id))]
    pub async fn put(&self, record: &PersistedWork) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO persisted_works (id, type_identifier, context, priority, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE SET
                type_identifier = excluded.type_identifier,
                context = excluded.context,
                priority = excluded.priority
            ",
        )
        .bind(&record.id)
        .bind(&record.type_identifier)
        .bind(record.context.as_deref())
        .bind(record.priority)
        .bind(record.enqueued_at)
        .execute(&self.pool)
        .await?;

        debug!("Persisted work record");
        Ok(())
    }

    /// Replace the context of an existing record.
    ///
    /// Returns `false` if there is no record with that id.
    #[instrument(name = "store.update", skip(self, context))]
    pub async fn update(&self, id: &str, context: Option<&[u8]>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE persisted_works SET context = ?2 WHERE id = ?1")
            .bind(id)
            .bind(context)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete the record with the given id.
    ///
    /// Removing a missing record is a no-op and returns `false`.
    #[instrument(name = "store.remove", skip(self))]
    pub async fn remove(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM persisted_works WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Load every record in scheduling order: higher priority first, then
    /// oldest first.
    pub async fn load_all(&self) -> Result<Vec<PersistedWork>, sqlx::Error> {
        sqlx::query_as::<_, PersistedWork>(
            r"
            SELECT id, type_identifier, context, priority, enqueued_at
            FROM persisted_works
            ORDER BY priority DESC, enqueued_at ASC, rowid ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Fetch a single record.
    pub async fn get(&self, id: &str) -> Result<Option<PersistedWork>, sqlx::Error> {
        sqlx::query_as::<_, PersistedWork>(
            r"
            SELECT id, type_identifier, context, priority, enqueued_at
            FROM persisted_works
            WHERE id = ?1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// The number of persisted records
    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM persisted_works")
            .fetch_one(&self.pool)
            .await
    }

    /// Close the underlying connection, flushing the write-ahead log.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Priority;
    use chrono::{Duration, Utc};
    use claims::{assert_none, assert_some};

    fn record(id: &str, priority: Priority) -> PersistedWork {
        PersistedWork::new(id, "test", Some(id.as_bytes().to_vec()), priority)
    }

    #[tokio::test]
    async fn put_overwrites_context_and_priority() -> anyhow::Result<()> {
        let store = WorkStore::in_memory().await?;

        let first = record("a", Priority::Low);
        store.put(&first).await?;

        let mut second = PersistedWork::new("a", "test", Some(b"new".to_vec()), Priority::High);
        second.enqueued_at = first.enqueued_at + Duration::hours(1);
        store.put(&second).await?;

        assert_eq!(store.count().await?, 1);
        let stored = assert_some!(store.get("a").await?);
        assert_eq!(stored.context.as_deref(), Some(&b"new"[..]));
        assert_eq!(stored.priority, Priority::High);
        assert_eq!(stored.enqueued_at, first.enqueued_at);

        Ok(())
    }

    #[tokio::test]
    async fn remove_and_update_missing_records_are_noops() -> anyhow::Result<()> {
        let store = WorkStore::in_memory().await?;

        assert!(!store.remove("missing").await?);
        assert!(!store.update("missing", Some(b"x")).await?);
        assert_none!(store.get("missing").await?);
        assert_eq!(store.count().await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn update_replaces_context() -> anyhow::Result<()> {
        let store = WorkStore::in_memory().await?;
        store.put(&record("a", Priority::Medium)).await?;

        assert!(store.update("a", None).await?);
        let stored = assert_some!(store.get("a").await?);
        assert_none!(stored.context);

        Ok(())
    }

    #[tokio::test]
    async fn load_all_orders_by_priority_then_age() -> anyhow::Result<()> {
        let store = WorkStore::in_memory().await?;
        let now = Utc::now();

        let mut old_low = record("old-low", Priority::Low);
        old_low.enqueued_at = now - Duration::minutes(10);
        let mut new_high = record("new-high", Priority::High);
        new_high.enqueued_at = now;
        let mut old_high = record("old-high", Priority::High);
        old_high.enqueued_at = now - Duration::minutes(5);
        let mut medium = record("medium", Priority::Medium);
        medium.enqueued_at = now - Duration::minutes(1);

        for r in [&old_low, &new_high, &old_high, &medium] {
            store.put(r).await?;
        }

        let ids: Vec<_> = store
            .load_all()
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["old-high", "new-high", "medium", "old-low"]);

        Ok(())
    }

    #[tokio::test]
    async fn records_survive_reopening_the_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("works.db");

        let store = WorkStore::open(&path).await?;
        store.put(&record("durable", Priority::Medium)).await?;
        store.close().await;

        let reopened = WorkStore::open(&path).await?;
        let stored = assert_some!(reopened.get("durable").await?);
        assert_eq!(stored.type_identifier, "test");

        Ok(())
    }
}
