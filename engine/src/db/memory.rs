//! Long-term memory fact repository
//!
//! Facts are upserted by `(user_id, category, text)`. Ranking happens in the
//! context store; this layer only filters and orders by last use.

use super::{from_millis, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sdk::types::{FactNote, Importance, MemoryFact, UserId};
use sqlx::{Row, SqlitePool};

/// Restricts which facts `query` returns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    pub category: Option<String>,
    /// Case-insensitive substring match on the fact text
    pub text_contains: Option<String>,
    pub limit: Option<i64>,
}

impl MemoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.text_contains = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Repository for memory facts
pub struct MemoryRepository {
    pool: SqlitePool,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a fact, or refresh the existing one with the same key
    ///
    /// Returns the fact id.
    pub async fn upsert(&self, user_id: &UserId, note: &FactNote, at: DateTime<Utc>) -> Result<i64> {
        let now = to_millis(at);

        let row = sqlx::query(
            r#"
            INSERT INTO memory_facts (user_id, category, text, importance, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, category, text) DO UPDATE SET
                importance = excluded.importance,
                last_used_at = MAX(last_used_at, excluded.last_used_at)
            RETURNING id
            "#,
        )
        .bind(user_id.as_str())
        .bind(&note.category)
        .bind(&note.text)
        .bind(note.importance.level())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert memory fact")?;

        Ok(row.get("id"))
    }

    /// Facts of a user matching `filter`, most recently used first
    pub async fn query(&self, user_id: &UserId, filter: &MemoryFilter) -> Result<Vec<MemoryFact>> {
        let pattern = filter
            .text_contains
            .as_ref()
            .map(|text| format!("%{}%", text.to_lowercase()));

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, category, text, importance, created_at, last_used_at
            FROM memory_facts
            WHERE user_id = ?
              AND (? IS NULL OR category = ?)
              AND (? IS NULL OR LOWER(text) LIKE ?)
            ORDER BY last_used_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(filter.category.as_deref())
        .bind(filter.category.as_deref())
        .bind(pattern.as_deref())
        .bind(pattern.as_deref())
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query memory facts")?;

        Ok(rows
            .into_iter()
            .map(|r| MemoryFact {
                id: r.get("id"),
                user_id: UserId::new(r.get::<String, _>("user_id")),
                category: r.get("category"),
                text: r.get("text"),
                importance: Importance::from_level(r.get("importance")),
                created_at: from_millis(r.get("created_at")),
                last_used_at: from_millis(r.get("last_used_at")),
            })
            .collect())
    }

    /// Refresh `last_used_at` of the given facts; never moves it backwards
    pub async fn touch(&self, user_id: &UserId, ids: &[i64], at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin memory transaction")?;

        let mut touched = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE memory_facts SET last_used_at = MAX(last_used_at, ?) WHERE user_id = ? AND id = ?",
            )
            .bind(to_millis(at))
            .bind(user_id.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to touch memory fact")?;

            touched += result.rows_affected();
        }

        tx.commit()
            .await
            .context("Failed to commit memory transaction")?;

        Ok(touched)
    }
}
