//! Semantic query ranker.
//!
//! Turns a free-text query into an ordered shortlist of active services
//! by cosine similarity against their stored embeddings. Read-only: the
//! ranker shares nothing mutable with the call pipeline beyond the
//! catalog itself.

use std::sync::Arc;

use serde::Serialize;

use crate::catalog::{Category, CatalogStore, Service, ServiceKind, StoreError};
use crate::embeddings::{EmbedError, Embedder};

/// Maximum result-set size a caller may request.
pub const MAX_RESULTS: usize = 50;

/// Result-set size when the caller does not specify one.
pub const DEFAULT_RESULTS: usize = 10;

/// Optional filters applied before ranking.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFilters {
    /// Restrict to one category.
    pub category: Option<Category>,
    /// Restrict to one service kind.
    pub kind: Option<ServiceKind>,
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedService {
    /// The matching service.
    #[serde(flatten)]
    pub service: Service,
    /// `1 − cosine distance` against the query embedding.
    pub similarity: f32,
}

/// Errors from query ranking.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The embedding collaborator failed.
    #[error("discovery unavailable")]
    DiscoveryUnavailable(#[from] EmbedError),

    /// The catalog could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cosine similarity between two vectors; `0.0` when either has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Ranks catalog services against natural-language queries.
pub struct QueryRanker {
    store: Arc<dyn CatalogStore>,
    embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for QueryRanker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRanker")
            .field("dimensions", &self.embedder.dimensions())
            .finish()
    }
}

impl QueryRanker {
    /// Creates a ranker over the given catalog and embedder.
    pub fn new(store: Arc<dyn CatalogStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Returns up to `limit` active services matching `filters`, ordered by
    /// descending similarity to `query`. Ties keep catalog insertion order.
    ///
    /// `limit` is clamped to `1..=`[`MAX_RESULTS`].
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::DiscoveryUnavailable`] when the embedding
    /// collaborator fails, [`SearchError::Store`] when the catalog does.
    pub async fn rank(
        &self,
        query: &str,
        filters: SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedService>, SearchError> {
        let limit = limit.clamp(1, MAX_RESULTS);
        let query_embedding = self.embedder.embed(query).await?;
        let dimensions = self.embedder.dimensions();

        let mut hits: Vec<RankedService> = Vec::new();
        for service in self.store.active_services().await? {
            if filters.category.is_some_and(|c| service.category != c)
                || filters.kind.is_some_and(|k| service.kind != k)
            {
                continue;
            }
            if service.embedding.len() != dimensions {
                tracing::warn!(
                    service = %service.id,
                    expected = dimensions,
                    got = service.embedding.len(),
                    "skipping service with mismatched embedding dimension"
                );
                continue;
            }
            let similarity = cosine_similarity(&service.embedding, &query_embedding);
            hits.push(RankedService {
                service,
                similarity,
            });
        }

        // Stable sort keeps insertion order for equal similarities.
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::service;
    use crate::catalog::MemoryCatalog;
    use async_trait::async_trait;

    struct FixedEmbedder {
        vector: Vec<f32>,
        fail: bool,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            if self.fail {
                return Err(EmbedError::Decode("boom".into()));
            }
            Ok(self.vector.clone())
        }

        fn dimensions(&self) -> usize {
            self.vector.len()
        }
    }

    fn ranker(store: Arc<MemoryCatalog>, vector: Vec<f32>) -> QueryRanker {
        QueryRanker::new(
            store,
            Arc::new(FixedEmbedder {
                vector,
                fail: false,
            }),
        )
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn orders_by_similarity_descending() {
        let store = Arc::new(MemoryCatalog::new());
        let mut near = service("near", 0);
        near.embedding = vec![1.0, 0.0, 0.0, 0.0];
        let mut far = service("far", 0);
        far.embedding = vec![0.0, 1.0, 0.0, 0.0];
        let mut middle = service("middle", 0);
        middle.embedding = vec![1.0, 1.0, 0.0, 0.0];
        for row in [far, middle, near] {
            store.insert_service(row).await.unwrap();
        }

        let hits = ranker(Arc::clone(&store), vec![1.0, 0.0, 0.0, 0.0])
            .rank("query", SearchFilters::default(), 10)
            .await
            .unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.service.name.as_str()).collect();
        assert_eq!(names, ["near", "middle", "far"]);
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let store = Arc::new(MemoryCatalog::new());
        for name in ["first", "second", "third"] {
            let mut row = service(name, 0);
            row.embedding = vec![1.0, 0.0, 0.0, 0.0];
            store.insert_service(row).await.unwrap();
        }

        let hits = ranker(Arc::clone(&store), vec![1.0, 0.0, 0.0, 0.0])
            .rank("query", SearchFilters::default(), 10)
            .await
            .unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.service.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn filters_and_inactive_rows_are_excluded() {
        let store = Arc::new(MemoryCatalog::new());
        let mut code = service("code", 0);
        code.category = Category::Code;
        let mut medical = service("medical", 0);
        medical.category = Category::Medical;
        let mut hidden = service("hidden", 0);
        hidden.is_active = false;
        for row in [code, medical, hidden] {
            store.insert_service(row).await.unwrap();
        }

        let hits = ranker(Arc::clone(&store), vec![1.0, 0.0, 0.0, 0.0])
            .rank(
                "query",
                SearchFilters {
                    category: Some(Category::Code),
                    kind: None,
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].service.name, "code");
    }

    #[tokio::test]
    async fn mismatched_embeddings_are_skipped() {
        let store = Arc::new(MemoryCatalog::new());
        let mut short = service("short", 0);
        short.embedding = vec![1.0];
        let ok = service("ok", 0);
        store.insert_service(short).await.unwrap();
        store.insert_service(ok).await.unwrap();

        let hits = ranker(Arc::clone(&store), vec![1.0, 0.0, 0.0, 0.0])
            .rank("query", SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].service.name, "ok");
    }

    #[tokio::test]
    async fn limit_is_clamped() {
        let store = Arc::new(MemoryCatalog::new());
        for i in 0..60 {
            store
                .insert_service(service(&format!("s{i}"), 0))
                .await
                .unwrap();
        }

        let ranker = ranker(Arc::clone(&store), vec![1.0, 0.0, 0.0, 0.0]);
        let capped = ranker
            .rank("query", SearchFilters::default(), 500)
            .await
            .unwrap();
        assert_eq!(capped.len(), MAX_RESULTS);
        let floor = ranker
            .rank("query", SearchFilters::default(), 0)
            .await
            .unwrap();
        assert_eq!(floor.len(), 1);
    }

    #[tokio::test]
    async fn embedder_failure_is_discovery_unavailable() {
        let store = Arc::new(MemoryCatalog::new());
        store.insert_service(service("any", 0)).await.unwrap();
        let ranker = QueryRanker::new(
            store,
            Arc::new(FixedEmbedder {
                vector: vec![0.0; 4],
                fail: true,
            }),
        );

        let err = ranker
            .rank("query", SearchFilters::default(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::DiscoveryUnavailable(_)));
    }
}
