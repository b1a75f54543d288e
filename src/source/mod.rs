pub mod openfda;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{normalize_drug_name, DrugFact};

pub use openfda::OpenFdaClient;

/// External system that knows facts about drugs.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Ordered facts for `drug_name`; empty when the source has no record.
    async fn fetch(&self, drug_name: &str) -> Result<Vec<DrugFact>>;
}

/// TTL cache in front of another source. Failures are never cached.
pub struct CachedSource {
    inner: Arc<dyn KnowledgeSource>,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<DrugFact>)>>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn KnowledgeSource>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KnowledgeSource for CachedSource {
    async fn fetch(&self, drug_name: &str) -> Result<Vec<DrugFact>> {
        let key = normalize_drug_name(drug_name);
        {
            let mut entries = self.entries.lock().await;
            match entries.get(&key) {
                Some((stored_at, facts)) if stored_at.elapsed() < self.ttl => {
                    tracing::debug!("Source cache hit for {}", key);
                    return Ok(facts.clone());
                }
                Some(_) => {
                    entries.remove(&key);
                }
                None => {}
            }
        }

        let facts = self.inner.fetch(&key).await?;
        self.entries
            .lock()
            .await
            .insert(key, (Instant::now(), facts.clone()));
        Ok(facts)
    }
}
