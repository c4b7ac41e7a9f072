//! Context Store
//!
//! Keeps a bounded conversation window per user and serves a relevance-ranked
//! slice of the user's long-term memory.
//!
//! # Concurrency
//!
//! The user map sits behind a short, non-async `RwLock`. Each user's window has
//! its own `tokio::sync::Mutex`, held across the durable write so that the
//! store and the in-memory window change together. A failed write leaves the
//! window untouched.

pub mod scorer;
pub mod window;

pub use scorer::{MemoryBudget, ScoringWeights};
pub use window::ContextWindow;

use crate::db::MemoryFilter;
use crate::store::Store;
use chrono::{DateTime, SubsecRound, Utc};
use sdk::errors::EngineError;
use sdk::types::{ConversationTurn, FactNote, MemoryFact, UserId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::debug;

/// A user's window, loaded lazily from the store on first access
type WindowSlot = Arc<Mutex<Option<ContextWindow>>>;

/// Per-user conversation windows plus ranked long-term memory
pub struct ContextStore {
    store: Arc<dyn Store>,
    window_size: usize,
    weights: ScoringWeights,
    windows: RwLock<HashMap<UserId, WindowSlot>>,
}

impl ContextStore {
    pub fn new(store: Arc<dyn Store>, window_size: usize) -> Self {
        Self {
            store,
            window_size: window_size.max(1),
            weights: ScoringWeights::default(),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn slot(&self, user_id: &UserId) -> WindowSlot {
        if let Some(slot) = self
            .windows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
        {
            return Arc::clone(slot);
        }

        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(windows.entry(user_id.clone()).or_default())
    }

    async fn load(
        &self,
        user_id: &UserId,
        slot: &mut Option<ContextWindow>,
    ) -> Result<(), EngineError> {
        if slot.is_none() {
            let turns = self.store.read_window(user_id, self.window_size).await?;
            debug!(user = %user_id, turns = turns.len(), "Loaded context window");
            *slot = Some(ContextWindow::from_turns(self.window_size, turns));
        }
        Ok(())
    }

    /// The user's current window, oldest first
    pub async fn window(&self, user_id: &UserId) -> Result<Vec<ConversationTurn>, EngineError> {
        let slot = self.slot(user_id);
        let mut guard = slot.lock().await;
        self.load(user_id, &mut guard).await?;

        Ok(guard.as_ref().map(ContextWindow::to_vec).unwrap_or_default())
    }

    /// Append one turn; see `append_turns`
    pub async fn append_turn(
        &self,
        user_id: &UserId,
        turn: ConversationTurn,
    ) -> Result<ConversationTurn, EngineError> {
        let mut stored = self.append_turns(user_id, vec![turn]).await?;
        stored
            .pop()
            .ok_or_else(|| EngineError::StoreUnavailable("no turn was written".to_string()))
    }

    /// Durably append turns, then push them into the window
    ///
    /// Turns are re-owned by `user_id` and their timestamps are truncated to
    /// milliseconds and clamped so the user's stream never goes backwards.
    /// Returns the turns as written.
    pub async fn append_turns(
        &self,
        user_id: &UserId,
        turns: Vec<ConversationTurn>,
    ) -> Result<Vec<ConversationTurn>, EngineError> {
        let slot = self.slot(user_id);
        let mut guard = slot.lock().await;
        self.load(user_id, &mut guard).await?;

        let mut floor = guard.as_ref().and_then(ContextWindow::last_timestamp);
        let turns: Vec<ConversationTurn> = turns
            .into_iter()
            .map(|mut turn| {
                turn.user_id = user_id.clone();
                turn.timestamp = clamp(turn.timestamp, floor);
                floor = Some(turn.timestamp);
                turn
            })
            .collect();

        self.store.append_turns(&turns).await?;

        if let Some(window) = guard.as_mut() {
            for turn in &turns {
                window.push(turn.clone());
            }
        }

        Ok(turns)
    }

    /// Facts of the user ranked for `query`, truncated to `budget`
    ///
    /// Does not write. Call `mark_used` for the facts that end up in a reply.
    pub async fn relevant_memories(
        &self,
        user_id: &UserId,
        query: &str,
        budget: MemoryBudget,
    ) -> Result<Vec<MemoryFact>, EngineError> {
        let facts = self
            .store
            .query_memory(user_id, &MemoryFilter::all())
            .await?;

        Ok(scorer::rank(facts, query, &self.weights, budget))
    }

    /// Refresh `last_used_at` of facts that were supplied as context
    pub async fn mark_used(
        &self,
        user_id: &UserId,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.store.touch_memories(user_id, ids, at).await
    }

    /// Upsert a fact noted by a handler
    pub async fn remember(
        &self,
        user_id: &UserId,
        note: &FactNote,
        at: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        self.store.upsert_memory(user_id, note, at).await
    }

    /// Drop the cached window of a user; it reloads from the store on next use
    pub fn evict(&self, user_id: &UserId) {
        self.windows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(user_id);
    }

    /// Number of users with a cached window
    pub fn cached_users(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn clamp(at: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let at = at.trunc_subsecs(3);
    match floor {
        Some(floor) if at < floor => floor,
        _ => at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use sdk::types::{Importance, Role};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    async fn sqlite_context(window_size: usize) -> (TempDir, ContextStore) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("ctx.db")).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(db));
        (temp_dir, ContextStore::new(store, window_size))
    }

    /// Wraps a store and fails writes while `fail_writes` is set
    struct FlakyStore {
        inner: SqliteStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn append_turns(&self, turns: &[ConversationTurn]) -> Result<(), EngineError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(EngineError::StoreUnavailable("disk full".to_string()));
            }
            self.inner.append_turns(turns).await
        }

        async fn read_window(
            &self,
            user_id: &UserId,
            limit: usize,
        ) -> Result<Vec<ConversationTurn>, EngineError> {
            self.inner.read_window(user_id, limit).await
        }

        async fn upsert_memory(
            &self,
            user_id: &UserId,
            note: &FactNote,
            at: DateTime<Utc>,
        ) -> Result<i64, EngineError> {
            self.inner.upsert_memory(user_id, note, at).await
        }

        async fn query_memory(
            &self,
            user_id: &UserId,
            filter: &MemoryFilter,
        ) -> Result<Vec<MemoryFact>, EngineError> {
            self.inner.query_memory(user_id, filter).await
        }

        async fn touch_memories(
            &self,
            user_id: &UserId,
            ids: &[i64],
            at: DateTime<Utc>,
        ) -> Result<(), EngineError> {
            self.inner.touch_memories(user_id, ids, at).await
        }
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_fifo() {
        let (_temp, ctx) = sqlite_context(3).await;
        let user = UserId::new("alice");

        for i in 0..5 {
            ctx.append_turn(&user, ConversationTurn::user(user.clone(), format!("m{}", i), Utc::now()))
                .await
                .unwrap();
        }

        let texts: Vec<_> = ctx
            .window(&user)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_window_reloads_from_store() {
        let (_temp, ctx) = sqlite_context(4).await;
        let user = UserId::new("bob");

        ctx.append_turns(
            &user,
            vec![
                ConversationTurn::user(user.clone(), "hello", Utc::now()),
                ConversationTurn::reply(user.clone(), Role::Agent, "conversation", "hi", Utc::now()),
            ],
        )
        .await
        .unwrap();

        ctx.evict(&user);
        assert_eq!(ctx.cached_users(), 0);

        let window = ctx.window(&user).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].role, Role::Agent);
    }

    #[tokio::test]
    async fn test_timestamps_are_clamped_non_decreasing() {
        let (_temp, ctx) = sqlite_context(5).await;
        let user = UserId::new("carol");
        let now = Utc::now();

        ctx.append_turn(&user, ConversationTurn::user(user.clone(), "late", now))
            .await
            .unwrap();
        let stored = ctx
            .append_turn(
                &user,
                ConversationTurn::user(user.clone(), "skewed", now - Duration::minutes(5)),
            )
            .await
            .unwrap();

        assert_eq!(stored.timestamp, now.trunc_subsecs(3));
        let window = ctx.window(&user).await.unwrap();
        assert!(window[0].timestamp <= window[1].timestamp);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_window_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("ctx.db")).await.unwrap();
        let flaky = Arc::new(FlakyStore {
            inner: SqliteStore::new(db),
            fail_writes: AtomicBool::new(false),
        });
        let ctx = ContextStore::new(Arc::clone(&flaky) as Arc<dyn Store>, 5);
        let user = UserId::new("dave");

        ctx.append_turn(&user, ConversationTurn::user(user.clone(), "kept", Utc::now()))
            .await
            .unwrap();

        flaky.fail_writes.store(true, Ordering::SeqCst);
        let err = ctx
            .append_turn(&user, ConversationTurn::user(user.clone(), "lost", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));

        let window = ctx.window(&user).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].text, "kept");
    }

    #[tokio::test]
    async fn test_relevant_memories_is_pure_until_marked() {
        let (_temp, ctx) = sqlite_context(5).await;
        let user = UserId::new("erin");
        let base = Utc::now() - Duration::hours(3);

        let old = ctx
            .remember(&user, &FactNote::new("family", "sister lives in Porto", Importance::Normal), base)
            .await
            .unwrap();
        ctx.remember(
            &user,
            &FactNote::new("preferences", "prefers green tea", Importance::Normal),
            base + Duration::hours(2),
        )
        .await
        .unwrap();

        let budget = MemoryBudget::facts(5);
        let first = ctx.relevant_memories(&user, "", budget).await.unwrap();
        let second = ctx.relevant_memories(&user, "", budget).await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first[0].id, old);

        ctx.mark_used(&user, &[old], Utc::now()).await.unwrap();
        let after = ctx.relevant_memories(&user, "", budget).await.unwrap();
        assert_eq!(after[0].id, old);
    }
}
