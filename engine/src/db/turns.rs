/// Conversation turn persistence
///
/// Turns are immutable. Writes are keyed by the turn id and use
/// `INSERT OR IGNORE`, so a retried batch never duplicates a turn.
use super::{from_millis, to_millis};
use anyhow::{Context, Result};
use sdk::types::{ConversationTurn, Role, UserId};
use sqlx::{Row, SqlitePool};

/// Turn repository for database operations
pub struct TurnRepository {
    pool: SqlitePool,
}

impl TurnRepository {
    /// Create a new turn repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a batch of turns in one transaction
    ///
    /// Returns the number of rows actually inserted.
    pub async fn append_batch(&self, turns: &[ConversationTurn]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin turn transaction")?;

        let mut inserted = 0;
        for turn in turns {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO conversation_turns (id, user_id, role, text, handler_name, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&turn.id)
            .bind(turn.user_id.as_str())
            .bind(turn.role.as_str())
            .bind(&turn.text)
            .bind(turn.handler_name.as_deref())
            .bind(to_millis(turn.timestamp))
            .execute(&mut *tx)
            .await
            .context("Failed to insert conversation turn")?;

            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .context("Failed to commit turn transaction")?;

        Ok(inserted)
    }

    /// Most recent `limit` turns of a user, oldest first
    pub async fn recent(&self, user_id: &UserId, limit: i64) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            "SELECT id, user_id, role, text, handler_name, timestamp FROM conversation_turns WHERE user_id = ? ORDER BY timestamp DESC, seq DESC LIMIT ?",
        )
        .bind(user_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversation turns")?;

        let mut turns: Vec<ConversationTurn> = rows
            .into_iter()
            .map(|r| ConversationTurn {
                id: r.get("id"),
                user_id: UserId::new(r.get::<String, _>("user_id")),
                role: Role::parse(&r.get::<String, _>("role")).unwrap_or(Role::User),
                text: r.get("text"),
                timestamp: from_millis(r.get("timestamp")),
                handler_name: r.get("handler_name"),
            })
            .collect();

        turns.reverse();
        Ok(turns)
    }

    /// Number of turns stored for a user
    pub async fn count_for_user(&self, user_id: &UserId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversation_turns WHERE user_id = ?")
                .bind(user_id.as_str())
                .fetch_one(&self.pool)
                .await
                .context("Failed to count conversation turns")?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let (_temp, db) = setup().await;
        let repo = db.turns();
        let user = UserId::new("alice");
        let start = Utc::now();

        let turns: Vec<_> = (0..5)
            .map(|i| {
                ConversationTurn::user(user.clone(), format!("turn {}", i), start + Duration::seconds(i))
            })
            .collect();
        repo.append_batch(&turns).await.unwrap();

        let recent = repo.recent(&user, 3).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[tokio::test]
    async fn test_retried_batch_is_idempotent() {
        let (_temp, db) = setup().await;
        let repo = db.turns();
        let user = UserId::new("bob");

        let batch = vec![
            ConversationTurn::user(user.clone(), "hello", Utc::now()),
            ConversationTurn::reply(user.clone(), Role::Agent, "conversation", "hi!", Utc::now()),
        ];

        assert_eq!(repo.append_batch(&batch).await.unwrap(), 2);
        assert_eq!(repo.append_batch(&batch).await.unwrap(), 0);
        assert_eq!(repo.count_for_user(&user).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let (_temp, db) = setup().await;
        let repo = db.turns();

        repo.append_batch(&[ConversationTurn::user(UserId::new("a"), "mine", Utc::now())])
            .await
            .unwrap();

        assert!(repo.recent(&UserId::new("b"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_and_handler_round_trip() {
        let (_temp, db) = setup().await;
        let repo = db.turns();
        let user = UserId::new("carol");

        let reply = ConversationTurn::reply(user.clone(), Role::Handler, "reminders", "Saved", Utc::now());
        repo.append_batch(std::slice::from_ref(&reply)).await.unwrap();

        let stored = repo.recent(&user, 1).await.unwrap();
        assert_eq!(stored[0].role, Role::Handler);
        assert_eq!(stored[0].handler_name.as_deref(), Some("reminders"));
        assert_eq!(stored[0].id, reply.id);
    }
}
