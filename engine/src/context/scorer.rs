//! Memory relevance scoring: declared importance, recency of use, topic overlap.

use chrono::{DateTime, Utc};
use sdk::types::MemoryFact;
use std::collections::BTreeSet;

/// Average characters per token (1 token ≈ 4 characters)
const CHARS_PER_TOKEN: usize = 4;

/// Weights for the three scoring factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    /// Weight for declared importance (default 0.5)
    pub importance: f64,
    /// Weight for recency of use (default 0.3)
    pub recency: f64,
    /// Weight for query topic overlap (default 0.2)
    pub topic: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            importance: 0.5,
            recency: 0.3,
            topic: 0.2,
        }
    }
}

/// Size limits for the memory slice handed to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub max_facts: usize,
    pub max_tokens: usize,
}

impl MemoryBudget {
    pub fn new(max_facts: usize, max_tokens: usize) -> Self {
        Self {
            max_facts,
            max_tokens,
        }
    }

    /// No token limit, only a fact count
    pub fn facts(max_facts: usize) -> Self {
        Self::new(max_facts, usize::MAX)
    }
}

/// Rough token estimate for a fact text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Recency relative to the user's most recently used fact.
///
/// Returns 1.0 for the newest fact and decays with the hours between them.
pub fn recency_score(last_used_at: DateTime<Utc>, newest: DateTime<Utc>) -> f64 {
    let hours = (newest - last_used_at).num_seconds().max(0) as f64 / 3600.0;
    1.0 / (1.0 + hours)
}

/// Lowercase alphanumeric tokens of three or more characters
pub fn significant_tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 3)
        .map(str::to_string)
        .collect()
}

/// Fraction of query tokens found in the fact text
pub fn topic_overlap(query_tokens: &BTreeSet<String>, text: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let fact_tokens = significant_tokens(text);
    let matches = query_tokens
        .iter()
        .filter(|token| fact_tokens.contains(*token))
        .count();
    matches as f64 / query_tokens.len() as f64
}

/// Rank facts for a query and truncate them to `budget`.
///
/// Pure function of its inputs: ties fall back to the most recent
/// `last_used_at`, then the higher id. Facts larger than the remaining token
/// budget are skipped.
pub fn rank(
    facts: Vec<MemoryFact>,
    query: &str,
    weights: &ScoringWeights,
    budget: MemoryBudget,
) -> Vec<MemoryFact> {
    let Some(newest) = facts.iter().map(|fact| fact.last_used_at).max() else {
        return Vec::new();
    };
    let query_tokens = significant_tokens(query);

    let mut scored: Vec<(f64, MemoryFact)> = facts
        .into_iter()
        .map(|fact| {
            let score = weights.importance * fact.importance.weight()
                + weights.recency * recency_score(fact.last_used_at, newest)
                + weights.topic * topic_overlap(&query_tokens, &fact.text);
            (score, fact)
        })
        .collect();

    scored.sort_by(|(a_score, a), (b_score, b)| {
        b_score
            .total_cmp(a_score)
            .then_with(|| b.last_used_at.cmp(&a.last_used_at))
            .then_with(|| b.id.cmp(&a.id))
    });

    let mut selected = Vec::new();
    let mut tokens = 0usize;
    for (_, fact) in scored {
        if selected.len() >= budget.max_facts {
            break;
        }
        let cost = estimate_tokens(&fact.text);
        if tokens.saturating_add(cost) > budget.max_tokens {
            continue;
        }
        tokens += cost;
        selected.push(fact);
    }
    selected
}
