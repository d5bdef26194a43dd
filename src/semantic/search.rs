//! Ranks stored semantic types by similarity to a draft description.

use std::{collections::HashMap, sync::Arc};

use rayon::prelude::*;
use serde::Serialize;

use super::{
    embeddings::{cosine_similarity, Embedder, EmbeddingError},
    text::{query_text, SimilarityQuery},
    vectors::{VectorRecord, VectorStore, VectorStoreError},
};

/// Results returned for general lookups.
pub const TOP_K: usize = 5;
/// Results returned when feeding a disambiguation step.
pub const DISAMBIGUATION_K: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityMatch {
    pub semantic_type: String,
    pub description: String,
    pub plugin_kind: String,
    pub examples: Vec<String>,
    pub similarity_score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector store error: {0}")]
    Storage(#[from] VectorStoreError),
}

pub struct SimilaritySearch {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
    default_threshold: f32,
    top_k: usize,
    disambiguation_k: usize,
}

impl SimilaritySearch {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<VectorStore>, default_threshold: f32) -> Self {
        SimilaritySearch {
            embedder,
            vectors,
            default_threshold,
            top_k: TOP_K,
            disambiguation_k: DISAMBIGUATION_K,
        }
    }

    pub fn with_limits(mut self, top_k: usize, disambiguation_k: usize) -> Self {
        self.top_k = top_k;
        self.disambiguation_k = disambiguation_k;
        self
    }

    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    /// Up to `top_k` distinct types scoring at least `threshold`, best first.
    /// An empty list means nothing similar exists.
    pub fn find_similar(
        &self,
        query: &SimilarityQuery,
        threshold: f32,
    ) -> Result<Vec<SimilarityMatch>, SearchError> {
        self.search(query, threshold, self.top_k)
    }

    pub fn find_most_similar(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Option<SimilarityMatch>, SearchError> {
        Ok(self
            .search(query, self.default_threshold, 1)?
            .into_iter()
            .next())
    }

    pub fn find_top_for_disambiguation(
        &self,
        query: &SimilarityQuery,
        threshold: f32,
    ) -> Result<Vec<SimilarityMatch>, SearchError> {
        self.search(query, threshold, self.disambiguation_k)
    }

    fn search(
        &self,
        query: &SimilarityQuery,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SimilarityMatch>, SearchError> {
        // an index that was never built has nothing to match against
        if !self.vectors.exists()? {
            log::debug!("vector index is empty, no similar types");
            return Ok(vec![]);
        }

        let text = query_text(query);
        let embedding = self.embedder.embed(&text)?;
        let records = self.vectors.get_all()?;

        let results = rank(&embedding, &records, threshold, limit);
        log::debug!(
            "{} of {} indexed types scored >= {threshold}",
            results.len(),
            records.len()
        );
        Ok(results)
    }
}

/// Scores every record against `query`, then filters, dedupes and ranks.
pub fn rank(
    query: &[f32],
    records: &[VectorRecord],
    threshold: f32,
    limit: usize,
) -> Vec<SimilarityMatch> {
    let scored: Vec<SimilarityMatch> = records
        .par_iter()
        .map(|record| SimilarityMatch {
            semantic_type: record.semantic_type.clone(),
            description: record.description.clone(),
            plugin_kind: record.plugin_kind.clone(),
            examples: record.examples.clone(),
            similarity_score: cosine_similarity(query, &record.embedding),
        })
        .collect();

    rank_scored(scored, threshold, limit)
}

/// Drops scores below `threshold`, keeps the best entry per type, sorts
/// descending and truncates to `limit`.
pub fn rank_scored(
    scored: Vec<SimilarityMatch>,
    threshold: f32,
    limit: usize,
) -> Vec<SimilarityMatch> {
    let mut best: HashMap<String, SimilarityMatch> = HashMap::new();

    for candidate in scored {
        if candidate.similarity_score < threshold {
            continue;
        }
        match best.get(&candidate.semantic_type) {
            Some(existing) if existing.similarity_score >= candidate.similarity_score => {}
            _ => {
                best.insert(candidate.semantic_type.clone(), candidate);
            }
        }
    }

    let mut results: Vec<SimilarityMatch> = best.into_values().collect();
    results.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.semantic_type.cmp(&b.semantic_type))
    });
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(name: &str, score: f32) -> SimilarityMatch {
        SimilarityMatch {
            semantic_type: name.to_string(),
            description: String::new(),
            plugin_kind: "regex".to_string(),
            examples: vec![],
            similarity_score: score,
        }
    }

    #[test]
    fn duplicates_collapse_to_best_score() {
        let results = rank_scored(
            vec![scored("A", 0.9), scored("A", 0.95), scored("B", 0.4)],
            0.5,
            TOP_K,
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].semantic_type, "A");
        assert!((results[0].similarity_score - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn results_sorted_and_truncated() {
        let input: Vec<_> = (0..8).map(|i| scored(&format!("T{i}"), i as f32 / 10.0)).collect();

        let results = rank_scored(input.clone(), 0.0, TOP_K);
        let names: Vec<_> = results.iter().map(|r| r.semantic_type.as_str()).collect();
        assert_eq!(names, vec!["T7", "T6", "T5", "T4", "T3"]);

        let results = rank_scored(input, 0.25, DISAMBIGUATION_K);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].semantic_type, "T7");
    }

    #[test]
    fn threshold_is_inclusive() {
        let results = rank_scored(vec![scored("A", 0.5)], 0.5, TOP_K);
        assert_eq!(results.len(), 1);
    }
}
