use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Direction, Distance, FieldType, Filter, OrderBy, PointStruct, ScoredPoint,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{IndexedRecord, MetadataFilter, RecordMetadata, RetrievalResult, ScoredChunk};

use super::vector_store::{ensure_dimension, rank, VectorStore};

const TEXT_KEY: &str = "text";
const DRUG_KEY: &str = "drug_name";
const SECTION_KEY: &str = "section";
const INDEX_KEY: &str = "chunk_index";
const SEQ_KEY: &str = "seq";

/// Qdrant collection with cosine distance. Point ids are random UUIDs, so
/// re-ingesting a drug adds new points next to the old ones.
///
/// Insertion order lives in an indexed `seq` payload field. The counter is
/// seeded from the collection on startup and assumes a single writer process.
pub struct QdrantVectorStore {
    client: Qdrant,
    collection_name: String,
    dimension: usize,
    next_seq: AtomicU64,
}

fn storage_error(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Storage(err.to_string())
}

impl QdrantVectorStore {
    pub async fn new(url: &str, collection_name: &str, dimension: usize) -> AnyResult<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let client = match Qdrant::from_url(url).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Qdrant client build failed: {:?}", e);
                anyhow::bail!("Qdrant client build failed: {}", e);
            }
        };

        let store = Self {
            client,
            collection_name: collection_name.to_string(),
            dimension,
            next_seq: AtomicU64::new(0),
        };

        if let Err(e) = store.ensure_collection().await {
            tracing::error!("Qdrant ensure_collection failed: {:?}", e);
            return Err(e);
        }
        let next = store.last_seq().await?.map_or(0, |seq| seq + 1);
        store.next_seq.store(next, Ordering::SeqCst);
        tracing::info!("Qdrant collection {} ready (next seq {})", collection_name, next);

        Ok(store)
    }

    async fn ensure_collection(&self) -> AnyResult<()> {
        if !self.client.collection_exists(&self.collection_name).await? {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                        VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                    ),
                )
                .await?;
        }
        // ordered scrolls need a payload index; creating it again is a no-op
        self.client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    SEQ_KEY,
                    FieldType::Integer,
                )
                .wait(true),
            )
            .await?;
        Ok(())
    }

    /// Highest `seq` stored in the collection.
    async fn last_seq(&self) -> AnyResult<Option<u64>> {
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection_name)
                    .limit(1)
                    .with_payload(true)
                    .order_by(OrderBy {
                        key: SEQ_KEY.to_string(),
                        direction: Some(Direction::Desc as i32),
                        start_from: None,
                    }),
            )
            .await?;
        Ok(response.result.first().and_then(|point| seq_of(&point.payload)))
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: Option<f32>,
        filter: &MetadataFilter,
    ) -> Result<Vec<(u64, ScoredChunk)>> {
        let mut builder =
            SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), limit as u64)
                .with_payload(true);
        if let Some(f) = to_filter(filter) {
            builder = builder.filter(f);
        }
        if let Some(threshold) = threshold {
            builder = builder.score_threshold(threshold);
        }

        let response = self.client.search_points(builder).await.map_err(storage_error)?;
        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let hit = Self::hit(point);
                if hit.is_none() {
                    tracing::warn!("Skipping Qdrant point with incomplete payload");
                }
                hit
            })
            .collect())
    }

    fn point(record: IndexedRecord, seq: u64) -> PointStruct {
        let mut payload = JsonMap::new();
        payload.insert(TEXT_KEY.to_string(), JsonValue::String(record.text));
        payload.insert(DRUG_KEY.to_string(), JsonValue::String(record.metadata.drug_name));
        payload.insert(SECTION_KEY.to_string(), JsonValue::String(record.metadata.section));
        payload.insert(INDEX_KEY.to_string(), JsonValue::from(record.metadata.index as u64));
        payload.insert(SEQ_KEY.to_string(), JsonValue::from(seq));
        PointStruct::new(Uuid::new_v4().to_string(), record.vector, payload)
    }

    fn hit(point: ScoredPoint) -> Option<(u64, ScoredChunk)> {
        let text = point.payload.get(TEXT_KEY)?.as_str()?.to_string();
        let drug_name = point.payload.get(DRUG_KEY)?.as_str()?.to_string();
        let section = point.payload.get(SECTION_KEY)?.as_str()?.to_string();
        let index = point.payload.get(INDEX_KEY)?.as_integer()? as usize;
        let seq = seq_of(&point.payload).unwrap_or(u64::MAX);
        Some((
            seq,
            ScoredChunk {
                text,
                score: point.score,
                metadata: RecordMetadata {
                    drug_name,
                    section,
                    index,
                },
            },
        ))
    }
}

fn seq_of(payload: &HashMap<String, QdrantValue>) -> Option<u64> {
    payload
        .get(SEQ_KEY)?
        .as_integer()
        .and_then(|seq| u64::try_from(seq).ok())
}

/// Score of the k-th hit when the hit after it ties with it, meaning more
/// points at that score may exist beyond what was returned.
fn straddling_tie(hits: &[(u64, ScoredChunk)], k: usize) -> Option<f32> {
    let kth = hits.get(k.checked_sub(1)?)?.1.score;
    let next = hits.get(k)?.1.score;
    (next >= kth).then_some(kth)
}

fn to_filter(filter: &MetadataFilter) -> Option<Filter> {
    let mut conditions = Vec::new();
    if let Some(ref drug) = filter.drug_name {
        conditions.push(Condition::matches(DRUG_KEY, drug.clone()));
    }
    if let Some(ref section) = filter.section {
        conditions.push(Condition::matches(SECTION_KEY, section.clone()));
    }
    if conditions.is_empty() {
        None
    } else {
        Some(Filter::must(conditions))
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: Vec<IndexedRecord>) -> Result<usize> {
        for record in &records {
            ensure_dimension(self.dimension, record.vector.len())?;
        }
        if records.is_empty() {
            return Ok(0);
        }

        let first_seq = self
            .next_seq
            .fetch_add(records.len() as u64, Ordering::SeqCst);
        let points: Vec<PointStruct> = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| Self::point(record, first_seq + i as u64))
            .collect();
        let inserted = points.len();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(storage_error)?;
        Ok(inserted)
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<RetrievalResult> {
        ensure_dimension(self.dimension, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        // one extra hit tells whether the k-th score is shared
        let mut hits = self.search(vector, k + 1, None, filter).await?;
        if let Some(threshold) = straddling_tie(&hits, k) {
            let mut limit = 2 * (k + 1);
            loop {
                hits = self.search(vector, limit, Some(threshold), filter).await?;
                if hits.len() < limit {
                    break;
                }
                limit *= 2;
            }
            tracing::debug!("Collected {} hits tied at or above score {}", hits.len(), threshold);
        }
        Ok(rank(hits, k))
    }

    async fn count(&self, filter: &MetadataFilter) -> Result<usize> {
        let mut builder = CountPointsBuilder::new(&self.collection_name).exact(true);
        if let Some(f) = to_filter(filter) {
            builder = builder.filter(f);
        }
        let response = self.client.count(builder).await.map_err(storage_error)?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<usize> {
        let removed = self.count(filter).await?;
        if removed == 0 {
            return Ok(0);
        }
        // a filter without conditions selects every point
        let selector = to_filter(filter).unwrap_or_default();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(selector)
                    .wait(true),
            )
            .await
            .map_err(storage_error)?;
        Ok(removed)
    }
}
