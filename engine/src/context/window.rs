//! Bounded per-user conversation window

use chrono::{DateTime, Utc};
use sdk::types::ConversationTurn;
use std::collections::VecDeque;

/// The most recent turns of one user, oldest first
///
/// Invariant: `len() <= capacity()`. Pushing into a full window evicts the
/// oldest turn.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl ContextWindow {
    /// Create an empty window; capacity is at least one turn
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build a window from stored turns (oldest first), keeping the newest
    pub fn from_turns(capacity: usize, turns: Vec<ConversationTurn>) -> Self {
        let mut window = Self::new(capacity);
        for turn in turns {
            window.push(turn);
        }
        window
    }

    /// Push a turn, returning the evicted turn if the window was full
    pub fn push(&mut self, turn: ConversationTurn) -> Option<ConversationTurn> {
        let evicted = if self.turns.len() == self.capacity {
            self.turns.pop_front()
        } else {
            None
        };
        self.turns.push_back(turn);
        evicted
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Timestamp of the newest turn
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.turns.back().map(|turn| turn.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sdk::types::UserId;

    fn turn(text: &str) -> ConversationTurn {
        ConversationTurn::user(UserId::new("u"), text, Utc::now())
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut window = ContextWindow::new(2);
        assert!(window.push(turn("a")).is_none());
        assert!(window.push(turn("b")).is_none());

        let evicted = window.push(turn("c")).unwrap();
        assert_eq!(evicted.text, "a");

        let texts: Vec<_> = window.turns().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let mut window = ContextWindow::new(0);
        window.push(turn("a"));
        window.push(turn("b"));
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_from_turns_keeps_newest() {
        let turns = vec![turn("1"), turn("2"), turn("3")];
        let window = ContextWindow::from_turns(2, turns);
        assert_eq!(window.to_vec()[0].text, "2");
    }

    proptest! {
        #[test]
        fn prop_window_is_bounded_fifo(capacity in 1usize..16, count in 0usize..64) {
            let mut window = ContextWindow::new(capacity);
            for i in 0..count {
                window.push(turn(&i.to_string()));
                prop_assert!(window.len() <= capacity);
            }

            let expected: Vec<String> = (count.saturating_sub(capacity)..count)
                .map(|i| i.to_string())
                .collect();
            let actual: Vec<String> = window.turns().map(|t| t.text.clone()).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
