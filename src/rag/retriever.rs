use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::models::{normalize_drug_name, MetadataFilter, RetrievalResult};

use super::embeddings::Embedder;
use super::retry::RetryPolicy;
use super::vector_store::VectorStore;

/// Embeds a question and fetches the closest chunks from the store.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    default_k: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        default_k: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            default_k,
            retry,
            timeout,
        }
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    /// Empty result when nothing matches; that is not an error.
    pub async fn retrieve(
        &self,
        question: &str,
        drug_name: Option<&str>,
        k: Option<usize>,
    ) -> Result<RetrievalResult> {
        if question.trim().is_empty() {
            return Err(PipelineError::InvalidInput("question must not be empty".to_string()));
        }
        let k = k.unwrap_or(self.default_k);
        let filter = match drug_name {
            Some(name) => MetadataFilter::drug(normalize_drug_name(name)),
            None => MetadataFilter::all(),
        };

        let embedder = &self.embedder;
        let vector = self
            .retry
            .run("question embedding", self.timeout, || async move {
                embedder.embed(question).await
            })
            .await?;

        let results = self.store.query(&vector, k, &filter).await?;
        tracing::debug!(
            "Retrieved {} chunks (k={}, drug filter: {:?})",
            results.len(),
            k,
            filter.drug_name
        );
        Ok(results)
    }
}
