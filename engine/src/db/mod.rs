//! SQLite persistence for conversation turns, memory facts and reminders

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::ConnectOptions;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub mod memory;
pub mod reminders;
pub mod turns;

pub use memory::{MemoryFilter, MemoryRepository};
pub use reminders::{Recurrence, Reminder, ReminderRepository, ReminderStatus};
pub use turns::TurnRepository;

/// Schema scripts, applied in order on every open. Each one must be
/// idempotent.
const MIGRATIONS: [(&str, &str); 1] = [(
    "001_initial",
    include_str!("../../migrations/001_initial.sql"),
)];

/// Shared SQLite pool behind the turn, memory and reminder repositories
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path` in WAL mode and apply the
    /// schema.
    ///
    /// SQLite replays a leftover WAL file on open, so an unclean shutdown needs
    /// no extra recovery step.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!(path = %db_path.display(), "Opening database");

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Migration {} failed", name))?;
            debug!(migration = name, "Migration applied");
        }
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap liveness probe used by `doctor`
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database did not answer")?;
        Ok(())
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;
        debug!("WAL checkpointed");
        Ok(())
    }

    /// Checkpoint and close every pooled connection
    pub async fn close(self) -> Result<()> {
        self.flush_wal().await?;
        self.pool.close().await;
        info!("Database closed");
        Ok(())
    }

    pub fn turns(&self) -> TurnRepository {
        TurnRepository::new(self.pool.clone())
    }

    pub fn memory(&self) -> MemoryRepository {
        MemoryRepository::new(self.pool.clone())
    }

    pub fn reminders(&self) -> ReminderRepository {
        ReminderRepository::new(self.pool.clone())
    }
}

/// Timestamps are stored as milliseconds since the Unix epoch
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
