/// Reminder persistence
///
/// Backing storage for the reminders handler. Due reminders are picked up by
/// the scheduler sweep and either completed or advanced to their next
/// occurrence.
use super::{from_millis, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sdk::types::UserId;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// How a reminder repeats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Recurrence::Daily),
            "weekly" => Some(Recurrence::Weekly),
            "monthly" => Some(Recurrence::Monthly),
            _ => None,
        }
    }

    /// Gap between two occurrences; a month is approximated as 30 days
    pub fn interval(&self) -> Duration {
        match self {
            Recurrence::Daily => Duration::days(1),
            Recurrence::Weekly => Duration::days(7),
            Recurrence::Monthly => Duration::days(30),
        }
    }
}

/// Reminder lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Completed => "completed",
            ReminderStatus::Cancelled => "cancelled",
        }
    }
}

/// Reminder record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    pub id: i64,
    pub user_id: UserId,
    pub text: String,
    pub due_at: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
    pub status: ReminderStatus,
    pub created_at: DateTime<Utc>,
}

/// Reminder repository for database operations
#[derive(Clone)]
pub struct ReminderRepository {
    pool: SqlitePool,
}

impl ReminderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a pending reminder
    pub async fn create(
        &self,
        user_id: &UserId,
        text: &str,
        due_at: DateTime<Utc>,
        recurrence: Option<Recurrence>,
    ) -> Result<Reminder> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO reminders (user_id, text, due_at, recurrence, status, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id.as_str())
        .bind(text)
        .bind(to_millis(due_at))
        .bind(recurrence.map(|r| r.as_str()))
        .bind(ReminderStatus::Pending.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .context("Failed to create reminder")?;

        Ok(Reminder {
            id: result.last_insert_rowid(),
            user_id: user_id.clone(),
            text: text.to_string(),
            due_at,
            recurrence,
            status: ReminderStatus::Pending,
            created_at: now,
        })
    }

    /// Pending reminders of a user, soonest first
    pub async fn pending_for_user(&self, user_id: &UserId) -> Result<Vec<Reminder>> {
        let rows = sqlx::query(
            "SELECT id, user_id, text, due_at, recurrence, status, created_at FROM reminders WHERE user_id = ? AND status = 'pending' ORDER BY due_at ASC, id ASC",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch reminders")?;

        Ok(rows.into_iter().map(row_to_reminder).collect())
    }

    /// Pending reminders of every user that are due at `now`
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let rows = sqlx::query(
            "SELECT id, user_id, text, due_at, recurrence, status, created_at FROM reminders WHERE status = 'pending' AND due_at <= ? ORDER BY due_at ASC, id ASC",
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch due reminders")?;

        Ok(rows.into_iter().map(row_to_reminder).collect())
    }

    /// Cancel a reminder owned by `user_id`; returns false if none matched
    pub async fn cancel(&self, user_id: &UserId, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE reminders SET status = 'cancelled' WHERE id = ? AND user_id = ? AND status = 'pending'",
        )
        .bind(id)
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to cancel reminder")?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a fired one-shot reminder as completed
    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE reminders SET status = 'completed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to complete reminder")?;

        Ok(())
    }

    /// Move a recurring reminder to its next occurrence
    pub async fn reschedule(&self, id: i64, next_due: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE reminders SET due_at = ? WHERE id = ?")
            .bind(to_millis(next_due))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to reschedule reminder")?;

        Ok(())
    }
}

fn row_to_reminder(r: sqlx::sqlite::SqliteRow) -> Reminder {
    Reminder {
        id: r.get("id"),
        user_id: UserId::new(r.get::<String, _>("user_id")),
        text: r.get("text"),
        due_at: from_millis(r.get("due_at")),
        recurrence: r
            .get::<Option<String>, _>("recurrence")
            .as_deref()
            .and_then(Recurrence::parse),
        status: match r.get::<String, _>("status").as_str() {
            "completed" => ReminderStatus::Completed,
            "cancelled" => ReminderStatus::Cancelled,
            _ => ReminderStatus::Pending,
        },
        created_at: from_millis(r.get("created_at")),
    }
}
