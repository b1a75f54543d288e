pub mod embeddings;
pub mod generator;
pub mod ingest;
pub mod local_store;
pub mod qdrant_store;
pub mod query;
pub mod retriever;
pub mod retry;
pub mod vector_store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{AppConfig, EmbeddingProviderKind, PipelineConfig};
use crate::error::{PipelineError, StageError};
use crate::models::{normalize_drug_name, Answer, IngestSummary, MetadataFilter};
use crate::source::{CachedSource, KnowledgeSource, OpenFdaClient};

use self::embeddings::{Embedder, FastEmbedder, HashingEmbedder, HttpEmbedder};
use self::generator::{ChatCompletionModel, LanguageModel};
use self::ingest::{IngestState, IngestionOrchestrator};
use self::query::QueryOrchestrator;
use self::vector_store::{create_vector_store, VectorStore};

/// Single handle over ingestion, querying and store maintenance.
pub struct RagEngine {
    ingestion: IngestionOrchestrator,
    query: QueryOrchestrator,
    store: Arc<dyn VectorStore>,
}

impl RagEngine {
    pub fn new(
        source: Arc<dyn KnowledgeSource>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LanguageModel>,
        config: PipelineConfig,
    ) -> std::result::Result<Self, PipelineError> {
        if embedder.dimension() != store.dimension() {
            return Err(PipelineError::DimensionMismatch {
                expected: store.dimension(),
                actual: embedder.dimension(),
            });
        }
        let query = QueryOrchestrator::new(embedder.clone(), store.clone(), llm, &config);
        let ingestion = IngestionOrchestrator::new(source, embedder, store.clone(), config)?;
        Ok(Self {
            ingestion,
            query,
            store,
        })
    }

    /// Wires the configured source, embedder, store and language model.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let mut source: Arc<dyn KnowledgeSource> = Arc::new(OpenFdaClient::new(&config.openfda)?);
        if config.openfda.cache_ttl_secs > 0 {
            tracing::info!("OpenFDA cache enabled (ttl {}s)", config.openfda.cache_ttl_secs);
            source = Arc::new(CachedSource::new(
                source,
                Duration::from_secs(config.openfda.cache_ttl_secs),
            ));
        }

        let emb = &config.embedding;
        let embedder: Arc<dyn Embedder> = match emb.provider {
            EmbeddingProviderKind::Fastembed => {
                tracing::info!("Loading local embedding model from {}", emb.model_dir.display());
                Arc::new(FastEmbedder::from_dir(&emb.model_dir, emb.dimension)?)
            }
            EmbeddingProviderKind::Http => {
                tracing::info!("Using remote embeddings: {} ({})", emb.model, emb.base_url);
                Arc::new(HttpEmbedder::new(
                    &emb.base_url,
                    emb.api_key.clone(),
                    emb.model.clone(),
                    emb.dimension,
                    emb.timeout(),
                )?)
            }
            EmbeddingProviderKind::Hashing => {
                tracing::warn!("Using hashing embedder; answers will rely on keyword overlap");
                Arc::new(HashingEmbedder::new(emb.dimension))
            }
        };

        let store = create_vector_store(&config.storage, embedder.dimension()).await?;

        let llm = Arc::new(ChatCompletionModel::new(
            config.llm.base_url.clone(),
            config.llm.api_key.clone(),
            config.llm.model.clone(),
            config.llm.temperature,
            config.llm.max_tokens,
            config.llm.timeout(),
        )?);

        Ok(Self::new(source, embedder, store, llm, config.pipeline())?)
    }

    pub async fn ingest(&self, drug_name: &str) -> std::result::Result<IngestSummary, StageError> {
        self.ingestion.ingest(drug_name).await
    }

    pub async fn ask(
        &self,
        question: &str,
        drug_name: Option<&str>,
    ) -> std::result::Result<Answer, StageError> {
        self.query.ask(question, drug_name).await
    }

    /// Records stored for `drug_name`, or for every drug.
    pub async fn count(&self, drug_name: Option<&str>) -> std::result::Result<usize, PipelineError> {
        let filter = match drug_name {
            Some(name) => MetadataFilter::drug(normalize_drug_name(name)),
            None => MetadataFilter::all(),
        };
        self.store.count(&filter).await
    }

    /// Removes every record. Returns the number removed.
    pub async fn clear(&self) -> std::result::Result<usize, PipelineError> {
        let removed = self.store.delete(&MetadataFilter::all()).await?;
        tracing::info!("Cleared {} records from the vector store", removed);
        Ok(removed)
    }

    pub async fn state_of(&self, drug_name: &str) -> Option<IngestState> {
        self.ingestion.state_of(drug_name).await
    }
}
