use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};
use crate::models::{IndexedRecord, MetadataFilter, RetrievalResult, ScoredChunk};

use super::vector_store::{cosine_similarity, ensure_dimension, rank, VectorStore};

/// One line of the on-disk file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    #[serde(flatten)]
    record: IndexedRecord,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<StoredRecord>,
    next_seq: u64,
}

/// In-process store persisted as JSON lines.
///
/// Upserts append to the file, deletes rewrite it through a temp file and
/// rename. Readers share the lock, so a query sees every upsert that
/// completed before it started.
pub struct LocalVectorStore {
    dimension: usize,
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

fn storage_error(context: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Storage(format!("{}: {}", context, err))
}

impl LocalVectorStore {
    /// Store without a backing file.
    pub fn in_memory(dimension: usize) -> Self {
        Self {
            dimension,
            path: None,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Opens (or creates) the store at `path`, loading existing records.
    pub async fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("failed to create store directory", e))?;
        }

        let mut inner = Inner::default();
        let mut needs_repair = false;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                // appends always end in a newline, anything else was interrupted
                needs_repair = !content.is_empty() && !content.ends_with('\n');
                let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
                for (i, line) in lines.iter().enumerate() {
                    let stored: StoredRecord = match serde_json::from_str(line) {
                        Ok(stored) => stored,
                        // a torn final line is what an interrupted append leaves behind
                        Err(e) if i + 1 == lines.len() => {
                            tracing::warn!("Dropping truncated last record in {}: {}", path.display(), e);
                            needs_repair = true;
                            break;
                        }
                        Err(e) => {
                            return Err(storage_error(
                                &format!("corrupt record on line {} of {}", i + 1, path.display()),
                                e,
                            ))
                        }
                    };
                    ensure_dimension(dimension, stored.record.vector.len())?;
                    inner.next_seq = inner.next_seq.max(stored.seq + 1);
                    inner.records.push(stored);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error("failed to read store file", e)),
        }

        tracing::info!(
            "Opened local vector store {} ({} records, {} dims)",
            path.display(),
            inner.records.len(),
            dimension
        );

        let store = Self {
            dimension,
            path: Some(path),
            inner: RwLock::new(inner),
        };
        if needs_repair {
            // later appends must start on a fresh line
            let records = store.inner.read().await.records.clone();
            store.rewrite(&records).await?;
        }
        Ok(store)
    }

    async fn append(&self, lines: &str) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| storage_error("failed to open store file", e))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| storage_error("failed to append records", e))?;
        file.sync_data()
            .await
            .map_err(|e| storage_error("failed to sync store file", e))?;
        Ok(())
    }

    async fn rewrite(&self, records: &[StoredRecord]) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        let content = encode_lines(records)?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| storage_error("failed to create temp store file", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| storage_error("failed to write temp store file", e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error("failed to sync temp store file", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_error("failed to replace store file", e))?;
        Ok(())
    }
}

fn encode_lines(records: &[StoredRecord]) -> Result<String> {
    let mut out = String::new();
    for stored in records {
        let line = serde_json::to_string(stored)
            .map_err(|e| storage_error("failed to encode record", e))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl VectorStore for LocalVectorStore {
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

        let mut inner = self.inner.write().await;
        let first_seq = inner.next_seq;
        let stored: Vec<StoredRecord> = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| StoredRecord {
                seq: first_seq + i as u64,
                record,
            })
            .collect();

        self.append(&encode_lines(&stored)?).await?;

        let inserted = stored.len();
        inner.next_seq = first_seq + inserted as u64;
        inner.records.extend(stored);
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

        let inner = self.inner.read().await;
        let hits = inner
            .records
            .iter()
            .filter(|stored| filter.matches(&stored.record.metadata))
            .map(|stored| {
                (
                    stored.seq,
                    ScoredChunk {
                        text: stored.record.text.clone(),
                        score: cosine_similarity(vector, &stored.record.vector),
                        metadata: stored.record.metadata.clone(),
                    },
                )
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn count(&self, filter: &MetadataFilter) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|stored| filter.matches(&stored.record.metadata))
            .count())
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let (removed, kept): (Vec<StoredRecord>, Vec<StoredRecord>) = inner
            .records
            .iter()
            .cloned()
            .partition(|stored| filter.matches(&stored.record.metadata));
        if removed.is_empty() {
            return Ok(0);
        }

        self.rewrite(&kept).await?;
        inner.records = kept;
        Ok(removed.len())
    }
}
