//! VectorStore abstraction (C2): CRUD + dense/keyword/hybrid search over
//! documents with metadata filters.
//!
//! Grounded in `rag/core/mod.rs::BaseClient` and `rag/storage/mod.rs` from
//! the teacher crate, which define a capability-set trait over a vector
//! database client. This module generalises that trait to the uniform
//! scoring/filter semantics spec'd in §4.2 and provides a fully working
//! in-memory reference implementation alongside thin remote-backend stubs
//! (§9 "polymorphic stores ... reachable through one façade").

pub mod backends;
pub mod filter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::{Document, SearchResult};
use crate::error::CoreError;
pub use filter::{FilterExpr, FilterGroup, FilterOp};

/// Distance metric used by a store's native index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    Cosine,
    L2,
    MaxInnerProduct,
    Dot,
    /// Alias for `L2`.
    Euclidean,
}

impl Distance {
    fn canonical(self) -> Distance {
        match self {
            Distance::Euclidean => Distance::L2,
            other => other,
        }
    }
}

/// Which retrieval mode `VectorStore::search` dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Vector,
    Keyword,
    Hybrid,
}

/// Weights for combining dense and keyword rankings in hybrid search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HybridWeights {
    pub dense: f64,
    pub keyword: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            dense: 0.7,
            keyword: 0.3,
        }
    }
}

/// Normalise a raw distance/similarity value into the `[0, 1]` "larger is
/// better" score space, per §4.2's uniform scoring rules. Monotonicity and
/// the target range are the only guaranteed properties (§9): backends may
/// pick whatever normalisation keeps those, and this is the one this core
/// uses everywhere so behaviour is uniform across backends.
pub fn normalize_score(distance: f64, metric: Distance) -> f64 {
    match metric.canonical() {
        Distance::Cosine => clamp01(1.0 - distance / 2.0),
        Distance::L2 => clamp01(1.0 / (1.0 + distance.max(0.0))),
        Distance::MaxInnerProduct | Distance::Dot => clamp01((distance + 1.0) / 2.0),
        Distance::Euclidean => unreachable!("canonicalised above"),
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Cosine distance (`1 - cosine_similarity`) between two equal-length
/// vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

/// Squared-free L2 (Euclidean) distance.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| ((*x as f64) - (*y as f64)).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Raw dot product / max-inner-product score (higher is more similar).
pub fn dot_score(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

/// Default filters merged into every document written by `insert`/`upsert`.
/// Document metadata takes precedence over default filters on key collision.
pub type DefaultFilters = std::collections::HashMap<String, serde_json::Value>;

/// Capability-set trait all vector store backends implement. Concrete
/// backends (in-memory, pgvector, Qdrant, Chroma, Pinecone) are reachable
/// through this one façade.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the backing collection/table. Idempotent: a no-op if it
    /// already exists.
    async fn create(&self) -> Result<(), CoreError>;

    /// Whether the backing collection/table exists.
    async fn exists(&self) -> Result<bool, CoreError>;

    /// Drop the backing collection/table and all its data.
    async fn drop(&self) -> Result<(), CoreError>;

    /// Backend-specific index maintenance. Idempotent no-op where the
    /// backend has nothing to optimise.
    async fn optimize(&self) -> Result<(), CoreError>;

    /// Insert documents, embedding any that lack `embeddings`, merging
    /// `default_filters` into each document's metadata (document metadata
    /// wins on key collision).
    async fn insert(&self, docs: Vec<Document>, default_filters: &DefaultFilters) -> Result<(), CoreError>;

    /// Insert-or-replace by `id`.
    async fn upsert(&self, docs: Vec<Document>, default_filters: &DefaultFilters) -> Result<(), CoreError>;

    /// Whether this backend supports `upsert` (vs. insert-only). Learning
    /// writes require this (§9).
    fn supports_upsert(&self) -> bool {
        true
    }

    /// Whether this backend supports native keyword search.
    fn supports_keyword_search(&self) -> bool {
        false
    }

    /// Dispatch to the configured default search type.
    async fn search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
    ) -> Result<Vec<SearchResult>, CoreError> {
        self.vector_search(query, k, filters).await
    }

    /// Dense (embedding similarity) search.
    async fn vector_search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
    ) -> Result<Vec<SearchResult>, CoreError>;

    /// Keyword (text-match) search. Backends without real text indexes
    /// should fail `Unsupported` rather than silently falling back to
    /// vector results (§4.2, §9).
    async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
    ) -> Result<Vec<SearchResult>, CoreError>;

    /// Hybrid search: run dense and keyword variants with `k' = 2k` each,
    /// combine via weighted reciprocal ranking, stable-sort descending,
    /// truncate to `k`. Ties break by later insertion first.
    async fn hybrid_search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&FilterExpr>,
        weights: HybridWeights,
    ) -> Result<Vec<SearchResult>, CoreError> {
        let k_prime = k.saturating_mul(2).max(1);
        let dense = self.vector_search(query, k_prime, filters).await?;
        let keyword = self.keyword_search(query, k_prime, filters).await?;
        Ok(combine_hybrid(dense, keyword, weights, k))
    }

    async fn get_count(&self) -> Result<usize, CoreError>;
    async fn id_exists(&self, id: &str) -> Result<bool, CoreError>;
    async fn name_exists(&self, name: &str) -> Result<bool, CoreError>;
    async fn doc_exists(&self, doc: &Document) -> Result<bool, CoreError> {
        self.id_exists(&doc.id).await
    }
}

/// Combine dense and keyword result lists via weighted rank fusion.
///
/// Each document's combined score is `weight * rank_score` summed across the
/// lists it appears in, where `rank_score = 1 - (rank / len)` (so the first
/// result scores closest to 1.0). Results present in only one list are still
/// included, weighted by that list alone. Ties are broken by insertion
/// order: the teacher's and this core's insertion order corresponds to
/// "most recently inserted first" among dense/keyword duplicates, so the
/// later-inserted (here: the dense-list, since it is combined first) entry
/// wins ties.
pub fn combine_hybrid(
    dense: Vec<SearchResult>,
    keyword: Vec<SearchResult>,
    weights: HybridWeights,
    k: usize,
) -> Vec<SearchResult> {
    use std::collections::HashMap;

    struct Combined {
        result: SearchResult,
        score: f64,
        order: usize,
    }

    let mut combined: HashMap<String, Combined> = HashMap::new();
    let mut order_counter = 0usize;

    let dense_len = dense.len().max(1);
    for (rank, r) in dense.into_iter().enumerate() {
        let rank_score = 1.0 - (rank as f64 / dense_len as f64);
        let contribution = weights.dense * rank_score;
        let id = r.document.id.clone();
        order_counter += 1;
        combined
            .entry(id)
            .and_modify(|c| c.score += contribution)
            .or_insert(Combined {
                result: r,
                score: contribution,
                order: order_counter,
            });
    }

    let keyword_len = keyword.len().max(1);
    for (rank, r) in keyword.into_iter().enumerate() {
        let rank_score = 1.0 - (rank as f64 / keyword_len as f64);
        let contribution = weights.keyword * rank_score;
        let id = r.document.id.clone();
        order_counter += 1;
        combined
            .entry(id)
            .and_modify(|c| c.score += contribution)
            .or_insert(Combined {
                result: r,
                score: contribution,
                order: order_counter,
            });
    }

    let mut items: Vec<Combined> = combined.into_values().collect();
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.order.cmp(&a.order))
    });

    items
        .into_iter()
        .take(k)
        .map(|c| SearchResult::new(c.result.document, c.score.clamp(0.0, 1.0), 1.0 - c.score.clamp(0.0, 1.0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cosine_monotone_and_bounded() {
        let s0 = normalize_score(0.0, Distance::Cosine);
        let s1 = normalize_score(1.0, Distance::Cosine);
        let s2 = normalize_score(2.0, Distance::Cosine);
        assert!(s0 > s1 && s1 > s2);
        assert!((0.0..=1.0).contains(&s0));
        assert!((0.0..=1.0).contains(&s2));
    }

    #[test]
    fn normalize_l2_monotone_and_bounded() {
        let s0 = normalize_score(0.0, Distance::L2);
        let s1 = normalize_score(5.0, Distance::L2);
        let s2 = normalize_score(50.0, Distance::L2);
        assert!(s0 > s1 && s1 > s2);
        assert!((0.0..=1.0).contains(&s0));
    }

    #[test]
    fn euclidean_aliases_l2() {
        assert_eq!(
            normalize_score(3.0, Distance::Euclidean),
            normalize_score(3.0, Distance::L2)
        );
    }
}
