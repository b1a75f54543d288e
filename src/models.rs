use serde::{Deserialize, Serialize};

/// Lookup key used for drug names everywhere in the pipeline.
pub fn normalize_drug_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// One normalized label section for a drug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrugFact {
    pub drug_name: String,
    pub section: String,
    pub text: String,
}

impl DrugFact {
    pub fn new(
        drug_name: impl Into<String>,
        section: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            drug_name: drug_name.into(),
            section: section.into(),
            text: text.into(),
        }
    }
}

/// Bounded slice of a `DrugFact` text. Offsets count chars, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub drug_name: String,
    pub section: String,
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            drug_name: self.drug_name.clone(),
            section: self.section.clone(),
            index: self.index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub drug_name: String,
    pub section: String,
    pub index: usize,
}

/// Unit persisted by a vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: RecordMetadata,
}

impl IndexedRecord {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            vector,
            text: chunk.text.clone(),
            metadata: chunk.metadata(),
        }
    }
}

/// Metadata predicate for store queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub drug_name: Option<String>,
    pub section: Option<String>,
}

impl MetadataFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn drug(name: impl Into<String>) -> Self {
        Self {
            drug_name: Some(name.into()),
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.drug_name.is_none() && self.section.is_none()
    }

    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        self.drug_name
            .as_deref()
            .map_or(true, |name| name == metadata.drug_name)
            && self
                .section
                .as_deref()
                .map_or(true, |section| section == metadata.section)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub text: String,
    pub score: f32,
    pub metadata: RecordMetadata,
}

/// Ranked search output, descending by score.
pub type RetrievalResult = Vec<ScoredChunk>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub drug_name: String,
    pub section: String,
    pub index: usize,
    pub score: f32,
    pub content_preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    /// False for the fixed reply given when nothing was retrieved.
    pub grounded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub drug_name: String,
    pub facts_fetched: usize,
    pub chunks_produced: usize,
    pub records_written: usize,
}

// HTTP API types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub drug_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub message: String,
    pub drug_name: String,
    pub facts_fetched: usize,
    pub chunks_indexed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub drug_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub grounded: bool,
    pub sources: Vec<SourceRef>,
}

impl From<Answer> for AnswerResponse {
    fn from(answer: Answer) -> Self {
        Self {
            answer: answer.text,
            grounded: answer.grounded,
            sources: answer.sources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrugStatusResponse {
    pub drug_name: String,
    pub records: usize,
    pub last_ingest_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub message: String,
    pub records_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub detail: String,
}

// OpenAI-compatible chat completion wire types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}
