use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failure kinds produced by the ingestion and answering pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rate limited")]
    UpstreamRateLimited { retry_after: Option<Duration> },

    #[error("upstream call timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("malformed upstream data: {0}")]
    MalformedUpstreamData(String),

    /// `transient` is set when the failure came from transport, throttling or a 5xx.
    #[error("embedding provider error: {message}")]
    EmbeddingProvider { message: String, transient: bool },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("generation error: {message}")]
    Generation { message: String, transient: bool },

    #[error("vector store error: {0}")]
    Storage(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ingestion already in progress for {0}")]
    IngestInProgress(String),
}

impl PipelineError {
    /// Whether the orchestrators may retry the call that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UpstreamUnavailable(_)
            | Self::UpstreamRateLimited { .. }
            | Self::UpstreamTimeout(_) => true,
            Self::EmbeddingProvider { transient, .. } | Self::Generation { transient, .. } => {
                *transient
            }
            Self::MalformedUpstreamData(_)
            | Self::DimensionMismatch { .. }
            | Self::Storage(_)
            | Self::InvalidInput(_)
            | Self::IngestInProgress(_) => false,
        }
    }

    /// Stable snake_case name used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRateLimited { .. } => "upstream_rate_limited",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::MalformedUpstreamData(_) => "malformed_upstream_data",
            Self::EmbeddingProvider { .. } => "embedding_provider_error",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Generation { .. } => "generation_error",
            Self::Storage(_) => "storage_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::IngestInProgress(_) => "ingest_in_progress",
        }
    }
}

/// Pipeline step that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetching,
    Chunking,
    Embedding,
    Indexing,
    Retrieval,
    Generation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
            Stage::Retrieval => "retrieval",
            Stage::Generation => "generation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator-level failure: the underlying cause tagged with its stage.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl StageError {
    pub fn new(stage: Stage, source: PipelineError) -> Self {
        Self { stage, source }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::UpstreamUnavailable("down".into()).is_transient());
        assert!(PipelineError::UpstreamRateLimited { retry_after: None }.is_transient());
        assert!(PipelineError::UpstreamTimeout(Duration::from_secs(1)).is_transient());
        assert!(!PipelineError::MalformedUpstreamData("bad".into()).is_transient());
        assert!(!PipelineError::DimensionMismatch { expected: 3, actual: 4 }.is_transient());
        assert!(PipelineError::Generation { message: "reset".into(), transient: true }.is_transient());
        assert!(!PipelineError::Generation { message: "empty".into(), transient: false }.is_transient());
    }

    #[test]
    fn test_stage_error_display_names_stage() {
        let err = StageError::new(
            Stage::Indexing,
            PipelineError::DimensionMismatch { expected: 384, actual: 768 },
        );
        let text = err.to_string();
        assert!(text.starts_with("indexing stage failed"));
        assert!(text.contains("expected 384, got 768"));
    }
}
