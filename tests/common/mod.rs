#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use drug_rag::config::PipelineConfig;
use drug_rag::error::{PipelineError, Result};
use drug_rag::models::DrugFact;
use drug_rag::rag::embeddings::{Embedder, HashingEmbedder};
use drug_rag::rag::generator::LanguageModel;
use drug_rag::rag::retry::RetryPolicy;
use drug_rag::rag::vector_store::VectorStore;
use drug_rag::rag::RagEngine;
use drug_rag::source::KnowledgeSource;

pub const DIM: usize = 64;

/// Facts keyed by normalized drug name; unknown drugs have no record.
#[derive(Default)]
pub struct FakeSource {
    pub facts: HashMap<String, Vec<(String, String)>>,
    pub error: Option<PipelineError>,
}

impl FakeSource {
    pub fn with(mut self, drug: &str, section: &str, text: impl Into<String>) -> Self {
        self.facts
            .entry(drug.to_string())
            .or_default()
            .push((section.to_string(), text.into()));
        self
    }

    pub fn failing(error: PipelineError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[async_trait]
impl KnowledgeSource for FakeSource {
    async fn fetch(&self, drug_name: &str) -> Result<Vec<DrugFact>> {
        if let Some(ref err) = self.error {
            return Err(err.clone());
        }
        Ok(self
            .facts
            .get(drug_name)
            .map(|facts| {
                facts
                    .iter()
                    .map(|(section, text)| DrugFact::new(drug_name, section.clone(), text.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Records prompts and answers with a fixed reply.
pub struct FakeModel {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub reply: String,
}

impl FakeModel {
    pub fn new(reply: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            reply: reply.to_string(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

pub fn pipeline(chunk_size: usize, chunk_overlap: usize, top_k: usize) -> PipelineConfig {
    PipelineConfig {
        chunk_size,
        chunk_overlap,
        top_k,
        retry: RetryPolicy::no_retry(),
        ..PipelineConfig::default()
    }
}

pub fn engine(
    source: FakeSource,
    store: Arc<dyn VectorStore>,
    model: Arc<FakeModel>,
    config: PipelineConfig,
) -> RagEngine {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(DIM));
    RagEngine::new(Arc::new(source), embedder, store, model, config).unwrap()
}
