//! Durable store seam
//!
//! The orchestrator and context store talk to persistence only through the
//! `Store` trait. Every failure surfaces as `EngineError::StoreUnavailable`.
//! Writes are safe to retry: turns are keyed by id and facts are upserts.

use crate::db::{Database, MemoryFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{ConversationTurn, FactNote, MemoryFact, UserId};

/// Transactional persistence used by the pipeline
#[async_trait]
pub trait Store: Send + Sync {
    /// Append turns as one transaction; already stored ids are skipped
    async fn append_turns(&self, turns: &[ConversationTurn]) -> Result<(), EngineError>;

    /// The most recent `limit` turns of a user, oldest first
    async fn read_window(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, EngineError>;

    /// Insert or refresh a fact keyed by `(user_id, category, text)`
    async fn upsert_memory(
        &self,
        user_id: &UserId,
        note: &FactNote,
        at: DateTime<Utc>,
    ) -> Result<i64, EngineError>;

    /// Facts of a user matching `filter`
    async fn query_memory(
        &self,
        user_id: &UserId,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryFact>, EngineError>;

    /// Refresh `last_used_at` of facts supplied as context
    async fn touch_memories(
        &self,
        user_id: &UserId,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Liveness probe
    async fn health_check(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

fn unavailable(error: anyhow::Error) -> EngineError {
    EngineError::StoreUnavailable(format!("{:#}", error))
}

/// `Store` backed by the SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_turns(&self, turns: &[ConversationTurn]) -> Result<(), EngineError> {
        self.db
            .turns()
            .append_batch(turns)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    async fn read_window(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, EngineError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .turns()
            .recent(user_id, limit)
            .await
            .map_err(unavailable)
    }

    async fn upsert_memory(
        &self,
        user_id: &UserId,
        note: &FactNote,
        at: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        self.db
            .memory()
            .upsert(user_id, note, at)
            .await
            .map_err(unavailable)
    }

    async fn query_memory(
        &self,
        user_id: &UserId,
        filter: &MemoryFilter,
    ) -> Result<Vec<MemoryFact>, EngineError> {
        self.db
            .memory()
            .query(user_id, filter)
            .await
            .map_err(unavailable)
    }

    async fn touch_memories(
        &self,
        user_id: &UserId,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db
            .memory()
            .touch(user_id, ids, at)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        self.db.ping().await.map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::Importance;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("store.db")).await.unwrap();
        let store = SqliteStore::new(db);
        let user = UserId::new("u");

        store
            .append_turns(&[ConversationTurn::user(user.clone(), "hi", Utc::now())])
            .await
            .unwrap();
        assert_eq!(store.read_window(&user, 10).await.unwrap().len(), 1);

        let id = store
            .upsert_memory(&user, &FactNote::new("general", "likes jazz", Importance::Normal), Utc::now())
            .await
            .unwrap();
        store.touch_memories(&user, &[id], Utc::now()).await.unwrap();

        let facts = store.query_memory(&user, &MemoryFilter::all()).await.unwrap();
        assert_eq!(facts[0].id, id);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_store_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("store.db")).await.unwrap();
        let store = SqliteStore::new(db.clone());
        db.close().await.unwrap();

        let err = store.read_window(&UserId::new("u"), 5).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
    }
}
