use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{PipelineConfig, ReingestPolicy};
use crate::error::{PipelineError, Result, Stage, StageError};
use crate::indexer::chunker::Chunker;
use crate::models::{normalize_drug_name, IndexedRecord, IngestSummary, MetadataFilter};
use crate::source::KnowledgeSource;

use super::embeddings::Embedder;
use super::vector_store::VectorStore;

/// Progress of one ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Fetching,
    Chunking,
    Embedding,
    Indexing,
    Done,
    Failed,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Fetching => "fetching",
            IngestState::Chunking => "chunking",
            IngestState::Embedding => "embedding",
            IngestState::Indexing => "indexing",
            IngestState::Done => "done",
            IngestState::Failed => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, IngestState::Done | IngestState::Failed)
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source -> chunker -> embedder -> store, one drug at a time.
///
/// Records written before a later failure stay in the store.
pub struct IngestionOrchestrator {
    source: Arc<dyn KnowledgeSource>,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: PipelineConfig,
    states: Mutex<HashMap<String, IngestState>>,
}

impl IngestionOrchestrator {
    pub fn new(
        source: Arc<dyn KnowledgeSource>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunk_size, config.chunk_overlap)?;
        Ok(Self {
            source,
            chunker,
            embedder,
            store,
            config,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Last known state for `drug_name`, if it was ever ingested.
    pub async fn state_of(&self, drug_name: &str) -> Option<IngestState> {
        self.states
            .lock()
            .await
            .get(&normalize_drug_name(drug_name))
            .copied()
    }

    pub async fn ingest(&self, drug_name: &str) -> std::result::Result<IngestSummary, StageError> {
        let drug = normalize_drug_name(drug_name);
        if drug.is_empty() {
            return Err(StageError::new(
                Stage::Fetching,
                PipelineError::InvalidInput("drug name must not be empty".to_string()),
            ));
        }

        {
            let mut states = self.states.lock().await;
            if states.get(&drug).map_or(false, IngestState::is_running) {
                return Err(StageError::new(
                    Stage::Fetching,
                    PipelineError::IngestInProgress(drug),
                ));
            }
            states.insert(drug.clone(), IngestState::Fetching);
        }

        // a panic must not leave the drug marked as running
        let result = std::panic::AssertUnwindSafe(self.run(&drug))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(summary)) => {
                self.set_state(&drug, IngestState::Done).await;
                tracing::info!(
                    "Ingestion of {} complete: {} facts, {} chunks, {} records",
                    drug,
                    summary.facts_fetched,
                    summary.chunks_produced,
                    summary.records_written
                );
                Ok(summary)
            }
            Ok(Err(e)) => {
                self.set_state(&drug, IngestState::Failed).await;
                tracing::error!("Ingestion of {} failed: {}", drug, e);
                Err(e)
            }
            Err(panic) => {
                self.set_state(&drug, IngestState::Failed).await;
                tracing::error!("Ingestion of {} panicked", drug);
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn set_state(&self, drug: &str, state: IngestState) {
        self.states.lock().await.insert(drug.to_string(), state);
    }

    async fn run(&self, drug: &str) -> std::result::Result<IngestSummary, StageError> {
        let retry = self.config.retry;
        let timeouts = self.config.timeouts;

        tracing::info!("[{}] fetching", drug);
        let source = &self.source;
        let facts = retry
            .run("knowledge source fetch", timeouts.source, || async move {
                source.fetch(drug).await
            })
            .await
            .map_err(|e| StageError::new(Stage::Fetching, e))?;

        if facts.is_empty() {
            tracing::warn!("[{}] source returned no facts", drug);
            return Ok(IngestSummary {
                drug_name: drug.to_string(),
                facts_fetched: 0,
                chunks_produced: 0,
                records_written: 0,
            });
        }

        self.set_state(drug, IngestState::Chunking).await;
        let chunks = self.chunker.split(drug, &facts);
        tracing::info!("[{}] {} facts split into {} chunks", drug, facts.len(), chunks.len());

        self.set_state(drug, IngestState::Embedding).await;
        // each future owns its inputs so the whole ingest future stays Send
        let pending: Vec<_> = chunks
            .iter()
            .map(|chunk| {
                let embedder = Arc::clone(&self.embedder);
                let text = chunk.text.clone();
                async move {
                    retry
                        .run("chunk embedding", timeouts.embedding, || {
                            let embedder = Arc::clone(&embedder);
                            let text = text.clone();
                            async move { embedder.embed(&text).await }
                        })
                        .await
                }
            })
            .collect();
        let vectors: Vec<Vec<f32>> = stream::iter(pending)
            .buffered(self.config.embed_concurrency.max(1))
            .try_collect()
            .await
            .map_err(|e| StageError::new(Stage::Embedding, e))?;

        self.set_state(drug, IngestState::Indexing).await;
        let records: Vec<IndexedRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexedRecord::from_chunk(chunk, vector))
            .collect();

        if self.config.reingest == ReingestPolicy::Replace {
            let removed = self
                .store
                .delete(&MetadataFilter::drug(drug))
                .await
                .map_err(|e| StageError::new(Stage::Indexing, e))?;
            tracing::info!("[{}] replaced {} existing records", drug, removed);
        }

        let mut written = 0;
        for batch in records.chunks(self.config.upsert_batch_size.max(1)) {
            written += self
                .store
                .upsert(batch.to_vec())
                .await
                .map_err(|e| StageError::new(Stage::Indexing, e))?;
        }

        Ok(IngestSummary {
            drug_name: drug.to_string(),
            facts_fetched: facts.len(),
            chunks_produced: chunks.len(),
            records_written: written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DrugFact, RetrievalResult};
    use crate::rag::embeddings::HashingEmbedder;
    use crate::rag::local_store::LocalVectorStore;
    use crate::rag::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const DIM: usize = 32;

    struct StaticSource {
        facts: Vec<(&'static str, String)>,
    }

    #[async_trait]
    impl KnowledgeSource for StaticSource {
        async fn fetch(&self, drug_name: &str) -> Result<Vec<DrugFact>> {
            Ok(self
                .facts
                .iter()
                .map(|(section, text)| DrugFact::new(drug_name, *section, text.clone()))
                .collect())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl KnowledgeSource for FailingSource {
        async fn fetch(&self, _drug_name: &str) -> Result<Vec<DrugFact>> {
            Err(PipelineError::MalformedUpstreamData("bad body".to_string()))
        }
    }

    /// Fails every embedding after the first `ok` calls.
    struct BrokenEmbedder {
        ok: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok {
                return Err(PipelineError::EmbeddingProvider {
                    message: "model crashed".to_string(),
                    transient: false,
                });
            }
            Ok(HashingEmbedder::new(DIM).embed_sync(text))
        }
    }

    /// Sleeps longer for earlier chunks so completions arrive out of order.
    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let delay = 20u64.saturating_sub(text.len() as u64 % 20);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(HashingEmbedder::new(DIM).embed_sync(text))
        }
    }

    /// Local store whose upserts start failing after `ok` batches.
    struct FlakyStore {
        inner: LocalVectorStore,
        ok: usize,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<usize> {
            if self.upserts.fetch_add(1, Ordering::SeqCst) >= self.ok {
                return Err(PipelineError::Storage("disk full".to_string()));
            }
            self.inner.upsert(records).await
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            filter: &MetadataFilter,
        ) -> Result<RetrievalResult> {
            self.inner.query(vector, k, filter).await
        }

        async fn count(&self, filter: &MetadataFilter) -> Result<usize> {
            self.inner.count(filter).await
        }

        async fn delete(&self, filter: &MetadataFilter) -> Result<usize> {
            self.inner.delete(filter).await
        }
    }

    struct GatedSource {
        started: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl KnowledgeSource for GatedSource {
        async fn fetch(&self, drug_name: &str) -> Result<Vec<DrugFact>> {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(vec![DrugFact::new(drug_name, "warnings", "short text")])
        }
    }

    fn config(reingest: ReingestPolicy) -> PipelineConfig {
        PipelineConfig {
            chunk_size: 200,
            chunk_overlap: 50,
            upsert_batch_size: 2,
            reingest,
            retry: RetryPolicy::no_retry(),
            ..PipelineConfig::default()
        }
    }

    fn aspirin_source() -> Arc<StaticSource> {
        Arc::new(StaticSource {
            facts: vec![
                ("indications", "a".repeat(500)),
                ("warnings", "Reye's syndrome warning.".to_string()),
            ],
        })
    }

    fn orchestrator(
        source: Arc<dyn KnowledgeSource>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        reingest: ReingestPolicy,
    ) -> IngestionOrchestrator {
        IngestionOrchestrator::new(source, embedder, store, config(reingest)).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_writes_every_chunk() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = orchestrator(
            aspirin_source(),
            Arc::new(HashingEmbedder::new(DIM)),
            store.clone(),
            ReingestPolicy::Additive,
        );

        let summary = orch.ingest(" Aspirin ").await.unwrap();
        assert_eq!(summary.drug_name, "aspirin");
        assert_eq!(summary.facts_fetched, 2);
        assert_eq!(summary.chunks_produced, 4);
        assert_eq!(summary.records_written, 4);
        assert_eq!(store.count(&MetadataFilter::drug("aspirin")).await.unwrap(), 4);
        assert_eq!(orch.state_of("ASPIRIN").await, Some(IngestState::Done));
    }

    #[tokio::test]
    async fn test_additive_reingest_never_decreases_count() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = orchestrator(
            aspirin_source(),
            Arc::new(HashingEmbedder::new(DIM)),
            store.clone(),
            ReingestPolicy::Additive,
        );
        orch.ingest("aspirin").await.unwrap();
        let first = store.count(&MetadataFilter::all()).await.unwrap();
        orch.ingest("aspirin").await.unwrap();
        let second = store.count(&MetadataFilter::all()).await.unwrap();
        assert!(second >= first);
        assert_eq!(second, 2 * first);
    }

    #[tokio::test]
    async fn test_replace_reingest_keeps_one_copy() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = orchestrator(
            aspirin_source(),
            Arc::new(HashingEmbedder::new(DIM)),
            store.clone(),
            ReingestPolicy::Replace,
        );
        orch.ingest("aspirin").await.unwrap();
        orch.ingest("aspirin").await.unwrap();
        assert_eq!(store.count(&MetadataFilter::drug("aspirin")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_embedding_order_is_preserved() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let source = Arc::new(StaticSource {
            facts: (0..6)
                .map(|i| ("warnings", format!("{} {}", "word".repeat(i + 1), i)))
                .collect(),
        });
        let orch = orchestrator(source, Arc::new(SlowEmbedder), store.clone(), ReingestPolicy::Additive);
        orch.ingest("aspirin").await.unwrap();

        let hashing = HashingEmbedder::new(DIM);
        for i in 0..6 {
            let text = format!("{} {}", "word".repeat(i + 1), i);
            let hits = store
                .query(&hashing.embed_sync(&text), 1, &MetadataFilter::all())
                .await
                .unwrap();
            assert_eq!(hits[0].text, text);
            assert_eq!(hits[0].metadata.index, i);
        }
    }

    #[tokio::test]
    async fn test_source_failure_is_tagged_fetching() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = orchestrator(
            Arc::new(FailingSource),
            Arc::new(HashingEmbedder::new(DIM)),
            store.clone(),
            ReingestPolicy::Additive,
        );
        let err = orch.ingest("aspirin").await.unwrap_err();
        assert_eq!(err.stage, Stage::Fetching);
        assert!(matches!(err.source, PipelineError::MalformedUpstreamData(_)));
        assert_eq!(orch.state_of("aspirin").await, Some(IngestState::Failed));
    }

    #[tokio::test]
    async fn test_embedding_failure_writes_nothing() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let embedder = Arc::new(BrokenEmbedder {
            ok: 2,
            calls: AtomicUsize::new(0),
        });
        let orch = orchestrator(aspirin_source(), embedder, store.clone(), ReingestPolicy::Replace);
        let err = orch.ingest("aspirin").await.unwrap_err();
        assert_eq!(err.stage, Stage::Embedding);
        assert_eq!(store.count(&MetadataFilter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_written_before_failure_remain() {
        let store = Arc::new(FlakyStore {
            inner: LocalVectorStore::in_memory(DIM),
            ok: 1,
            upserts: AtomicUsize::new(0),
        });
        let orch = orchestrator(
            aspirin_source(),
            Arc::new(HashingEmbedder::new(DIM)),
            store.clone(),
            ReingestPolicy::Additive,
        );
        let err = orch.ingest("aspirin").await.unwrap_err();
        assert_eq!(err.stage, Stage::Indexing);
        assert!(matches!(err.source, PipelineError::Storage(_)));
        assert_eq!(store.count(&MetadataFilter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_source_writes_nothing() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = orchestrator(
            Arc::new(StaticSource { facts: Vec::new() }),
            Arc::new(HashingEmbedder::new(DIM)),
            store.clone(),
            ReingestPolicy::Additive,
        );
        let summary = orch.ingest("unknowndrug").await.unwrap();
        assert_eq!(summary.facts_fetched, 0);
        assert_eq!(summary.records_written, 0);
    }

    #[tokio::test]
    async fn test_concurrent_ingest_of_same_drug_is_rejected() {
        let source = Arc::new(GatedSource {
            started: Notify::new(),
            gate: Notify::new(),
        });
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = Arc::new(orchestrator(
            source.clone(),
            Arc::new(HashingEmbedder::new(DIM)),
            store,
            ReingestPolicy::Additive,
        ));

        let running = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.ingest("aspirin").await })
        };
        source.started.notified().await;
        assert_eq!(orch.state_of("aspirin").await, Some(IngestState::Fetching));

        let err = orch.ingest("Aspirin").await.unwrap_err();
        assert!(matches!(err.source, PipelineError::IngestInProgress(_)));

        source.gate.notify_one();
        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.records_written, 1);
    }

    #[tokio::test]
    async fn test_ingest_runs_on_spawned_task_with_parallel_embedding() {
        let store = Arc::new(LocalVectorStore::in_memory(DIM));
        let orch = Arc::new(orchestrator(
            aspirin_source(),
            Arc::new(SlowEmbedder),
            store.clone(),
            ReingestPolicy::Additive,
        ));
        assert!(orch.config.embed_concurrency > 1);

        let handles: Vec<_> = ["aspirin", "ibuprofen"]
            .into_iter()
            .map(|drug| {
                let orch = Arc::clone(&orch);
                tokio::spawn(async move { orch.ingest(drug).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().records_written, 4);
        }
        assert_eq!(store.count(&MetadataFilter::all()).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_blank_drug_name_is_rejected() {
        let orch = orchestrator(
            aspirin_source(),
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(LocalVectorStore::in_memory(DIM)),
            ReingestPolicy::Additive,
        );
        let err = orch.ingest("  ").await.unwrap_err();
        assert!(matches!(err.source, PipelineError::InvalidInput(_)));
        assert_eq!(orch.state_of("").await, None);
    }
}
