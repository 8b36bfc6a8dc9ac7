//! Similarity retrieval: ranking convention, per-key dedup and the retriever.
//!
//! Scores are cosine similarity and higher is better
//! ([`RankDirection::CANONICAL`]). The direction is still an explicit value
//! threaded through every query and sort so stores with the opposite
//! convention (raw distances) can be ranked correctly.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::embeddings::{Embedder, VectorLiteral};
use crate::vector_store::{ScopeFilter, VectorStore};

/// Which end of the score range is "more similar".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RankDirection {
    /// Larger scores rank first (cosine similarity).
    HigherIsBetter,
    /// Smaller scores rank first (distances).
    LowerIsBetter,
}

impl RankDirection {
    /// Convention used throughout the crate.
    pub const CANONICAL: RankDirection = RankDirection::HigherIsBetter;

    /// True when `candidate` strictly outranks `current`.
    pub fn is_better(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::HigherIsBetter => candidate > current,
            Self::LowerIsBetter => candidate < current,
        }
    }

    /// Ordering that places better scores first.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::HigherIsBetter => ord.reverse(),
            Self::LowerIsBetter => ord,
        }
    }
}

impl Default for RankDirection {
    fn default() -> Self {
        Self::CANONICAL
    }
}

/// One scored row returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalRow {
    /// Resource id.
    pub entity_id: String,
    /// Grouping key (patient id).
    pub group_key: String,
    /// Resource type.
    pub category: String,
    /// Similarity score.
    pub score: f64,
    /// Stored passage text.
    pub payload: String,
}

/// Stable sort of rows, best first.
pub fn sort_rows(rows: &mut [RetrievalRow], direction: RankDirection) {
    rows.sort_by(|a, b| direction.compare(a.score, b.score));
}

/// Keeps the best-scoring row per `group_key`, re-sorted best first.
///
/// On equal scores the first row seen for a key wins.
pub fn dedupe_best_per_key(rows: Vec<RetrievalRow>, direction: RankDirection) -> Vec<RetrievalRow> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<RetrievalRow> = Vec::new();
    for row in rows {
        match slots.get(&row.group_key) {
            Some(&slot) => {
                if direction.is_better(row.score, kept[slot].score) {
                    kept[slot] = row;
                }
            }
            None => {
                slots.insert(row.group_key.clone(), kept.len());
                kept.push(row);
            }
        }
    }
    sort_rows(&mut kept, direction);
    kept
}

/// Top-K rows ordered by the declared direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResultSet {
    rows: Vec<RetrievalRow>,
    direction: RankDirection,
}

impl RankedResultSet {
    /// Sorts `rows` best first and keeps at most `top_k`.
    pub fn new(mut rows: Vec<RetrievalRow>, direction: RankDirection, top_k: usize) -> Self {
        sort_rows(&mut rows, direction);
        rows.truncate(top_k);
        Self { rows, direction }
    }

    /// An empty set ("no match").
    pub fn empty(direction: RankDirection) -> Self {
        Self {
            rows: Vec::new(),
            direction,
        }
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Ranking direction of the set.
    pub fn direction(&self) -> RankDirection {
        self.direction
    }

    /// Rows best first.
    pub fn rows(&self) -> &[RetrievalRow] {
        &self.rows
    }

    /// Consumes the set.
    pub fn into_rows(self) -> Vec<RetrievalRow> {
        self.rows
    }

    /// Best row per group key.
    pub fn best_per_key(self) -> Vec<RetrievalRow> {
        dedupe_best_per_key(self.rows, self.direction)
    }
}

/// Embeds questions and runs scoped top-K queries against a store.
pub struct SimilarityRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    direction: RankDirection,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl SimilarityRetriever {
    /// Builds a retriever; `cache_size` of 0 disables the query embedding cache.
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>, cache_size: usize) -> Self {
        Self {
            store,
            embedder,
            direction: RankDirection::CANONICAL,
            cache: NonZeroUsize::new(cache_size).map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Overrides the ranking direction.
    pub fn with_direction(mut self, direction: RankDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Ranking direction used for queries.
    pub fn direction(&self) -> RankDirection {
        self.direction
    }

    /// Runs a top-K query for an already-embedded vector.
    pub async fn search(
        &self,
        query: &[f32],
        scope: &ScopeFilter,
        top_k: usize,
    ) -> Result<RankedResultSet> {
        if top_k == 0 {
            return Ok(RankedResultSet::empty(self.direction));
        }
        let literal = VectorLiteral::from_embedding(query);
        let rows = self
            .store
            .nearest(&literal, scope, top_k, self.direction)
            .await?;
        debug!(rows = rows.len(), top_k, "similarity query finished");
        Ok(RankedResultSet::new(rows, self.direction, top_k))
    }

    /// Embeds `question` off the async executor and searches with it.
    pub async fn retrieve(
        &self,
        question: &str,
        scope: &ScopeFilter,
        top_k: usize,
    ) -> Result<RankedResultSet> {
        let embedding = self.embed_query(question).await?;
        self.search(&embedding, scope, top_k).await
    }

    async fn embed_query(&self, question: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().await.get(question).cloned() {
                return Ok(hit);
            }
        }
        let embedder = Arc::clone(&self.embedder);
        let text = question.to_string();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|err| anyhow!("embedding task join error: {err}"))??;
        if let Some(cache) = &self.cache {
            cache
                .lock()
                .await
                .put(question.to_string(), embedding.clone());
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, id: &str, score: f64) -> RetrievalRow {
        RetrievalRow {
            entity_id: id.into(),
            group_key: key.into(),
            category: "Condition".into(),
            score,
            payload: format!("{key}/{id}"),
        }
    }

    fn keys_and_scores(rows: &[RetrievalRow]) -> Vec<(&str, f64)> {
        rows.iter().map(|r| (r.group_key.as_str(), r.score)).collect()
    }

    #[test]
    fn keeps_best_row_per_patient() {
        let rows = vec![
            row("P1", "a", 0.9),
            row("P1", "b", 0.95),
            row("P1", "c", 0.4),
            row("P2", "d", 0.99),
        ];
        let deduped = dedupe_best_per_key(rows, RankDirection::CANONICAL);
        assert_eq!(keys_and_scores(&deduped), vec![("P2", 0.99), ("P1", 0.95)]);
        assert_eq!(deduped[1].entity_id, "b");
    }

    #[test]
    fn ascending_direction_prefers_small_scores() {
        let rows = vec![row("P1", "a", 0.3), row("P1", "b", 0.1), row("P2", "c", 0.2)];
        let deduped = dedupe_best_per_key(rows, RankDirection::LowerIsBetter);
        assert_eq!(keys_and_scores(&deduped), vec![("P1", 0.1), ("P2", 0.2)]);
    }

    #[test]
    fn ties_keep_first_seen_row() {
        let rows = vec![row("P1", "first", 0.5), row("P1", "second", 0.5)];
        let deduped = dedupe_best_per_key(rows, RankDirection::CANONICAL);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].entity_id, "first");
    }

    #[test]
    fn dedup_is_idempotent_and_total() {
        assert!(dedupe_best_per_key(Vec::new(), RankDirection::CANONICAL).is_empty());
        let rows = vec![
            row("P3", "x", 0.2),
            row("P1", "a", 0.7),
            row("P3", "y", 0.8),
            row("P2", "b", 0.7),
        ];
        let once = dedupe_best_per_key(rows, RankDirection::CANONICAL);
        let twice = dedupe_best_per_key(once.clone(), RankDirection::CANONICAL);
        assert_eq!(once, twice);
        assert_eq!(keys_and_scores(&once), vec![("P3", 0.8), ("P1", 0.7), ("P2", 0.7)]);
    }

    #[test]
    fn ranked_set_sorts_and_truncates() {
        let rows = vec![row("P1", "a", 0.2), row("P2", "b", 0.9), row("P3", "c", 0.5)];
        let set = RankedResultSet::new(rows, RankDirection::CANONICAL, 2);
        assert_eq!(keys_and_scores(set.rows()), vec![("P2", 0.9), ("P3", 0.5)]);
        assert_eq!(set.len(), 2);
        assert!(RankedResultSet::empty(RankDirection::CANONICAL).is_empty());
    }

    #[test]
    fn ties_are_not_better() {
        assert!(RankDirection::HigherIsBetter.is_better(0.9, 0.8));
        assert!(!RankDirection::HigherIsBetter.is_better(0.8, 0.8));
    }
}
