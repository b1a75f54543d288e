use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{Stage, StageError};
use crate::models::Answer;

use super::embeddings::Embedder;
use super::generator::{AnswerGenerator, LanguageModel};
use super::retriever::Retriever;
use super::vector_store::VectorStore;

/// Retriever followed by the answer generator for one question.
pub struct QueryOrchestrator {
    retriever: Retriever,
    generator: AnswerGenerator,
}

impl QueryOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LanguageModel>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            retriever: Retriever::new(
                embedder,
                store,
                config.top_k,
                config.retry,
                config.timeouts.embedding,
            ),
            generator: AnswerGenerator::new(
                llm,
                config.max_context_chars,
                config.retry,
                config.timeouts.generation,
            ),
        }
    }

    pub async fn ask(
        &self,
        question: &str,
        drug_name: Option<&str>,
    ) -> Result<Answer, StageError> {
        let results = self
            .retriever
            .retrieve(question, drug_name, None)
            .await
            .map_err(|e| StageError::new(Stage::Retrieval, e))?;
        tracing::info!("Answering with {} retrieved chunks", results.len());

        self.generator
            .generate(question, &results)
            .await
            .map_err(|e| StageError::new(Stage::Generation, e))
    }
}
