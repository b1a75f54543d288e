//! Vector store abstraction shared by the local and Qdrant backends.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use crate::models::{IndexedRecord, MetadataFilter, RetrievalResult, ScoredChunk};

use super::local_store::LocalVectorStore;
use super::qdrant_store::QdrantVectorStore;

/// Persistence and cosine-similarity search over indexed chunks.
///
/// Implementations enforce a single vector dimension on both writes and
/// queries, and return results ordered by descending score with ties broken
/// by insertion order.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Dimension every stored and queried vector must have.
    fn dimension(&self) -> usize;

    /// Writes all records or none of them. Returns the number inserted.
    async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<usize>;

    /// Top `k` records matching `filter`, never padded.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<RetrievalResult>;

    async fn count(&self, filter: &MetadataFilter) -> Result<usize>;

    /// Removes matching records. Returns the number removed.
    async fn delete(&self, filter: &MetadataFilter) -> Result<usize>;
}

/// Creates the configured backend.
pub async fn create_vector_store(
    storage: &StorageConfig,
    dimension: usize,
) -> anyhow::Result<Arc<dyn VectorStore>> {
    match storage {
        StorageConfig::Local { path } => {
            let store = LocalVectorStore::open(path, dimension).await?;
            Ok(Arc::new(store))
        }
        StorageConfig::Qdrant { url, collection } => {
            let store = QdrantVectorStore::new(url, collection, dimension).await?;
            Ok(Arc::new(store))
        }
    }
}

pub fn ensure_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(PipelineError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Cosine similarity; zero vectors score 0.
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

/// Sorts `(sequence, hit)` pairs by score desc then sequence asc, keeps `k`.
pub fn rank(mut hits: Vec<(u64, ScoredChunk)>, k: usize) -> RetrievalResult {
    hits.sort_by(|(seq_a, a), (seq_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(seq_a.cmp(seq_b))
    });
    hits.truncate(k);
    hits.into_iter().map(|(_, hit)| hit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordMetadata;

    fn hit(index: usize, score: f32) -> ScoredChunk {
        ScoredChunk {
            text: format!("chunk {}", index),
            score,
            metadata: RecordMetadata {
                drug_name: "aspirin".to_string(),
                section: "warnings".to_string(),
                index,
            },
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_breaks_ties_by_insertion_order() {
        let hits = vec![(5, hit(5, 0.5)), (2, hit(2, 0.9)), (1, hit(1, 0.5)), (3, hit(3, 0.5))];
        let ranked = rank(hits, 3);
        let order: Vec<usize> = ranked.iter().map(|h| h.metadata.index).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_rank_zero_k() {
        assert!(rank(vec![(0, hit(0, 1.0))], 0).is_empty());
    }
}
