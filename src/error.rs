use serde_json::json;
use thiserror::Error;

/// Closed error taxonomy for the pipeline. Every failure that crosses a
/// service boundary is one of these kinds; the RPC layer serializes them as
/// `{status: "error", error: <message>, kind: <kind>}` and never re-raises.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing required argument, unknown category, unknown duplicate policy.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Metadata fails schema validation.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Filter DSL contains an unknown operator or malformed node.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Retrieve/update targets an ID absent from the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Metadata update cannot preserve a vector the store declined to return.
    #[error("vector missing: {0}")]
    VectorMissing(String),

    /// A filtered operation hit a payload field lacking an index.
    #[error("index required: {0}")]
    IndexRequired(String),

    /// Backup manifest checksum mismatch.
    #[error("backup corrupted: {0}")]
    BackupCorrupted(String),

    /// Transport-level failure calling the store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The embedder raised.
    #[error("embedder failed: {0}")]
    EmbedderFailed(String),

    /// Splitter produced zero chunks from non-empty input.
    #[error("chunking failed: {0}")]
    ChunkingFailed(String),
}

impl PipelineError {
    /// Stable kind string carried in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "InvalidInput",
            PipelineError::InvalidMetadata(_) => "InvalidMetadata",
            PipelineError::InvalidFilter(_) => "InvalidFilter",
            PipelineError::NotFound(_) => "NotFound",
            PipelineError::VectorMissing(_) => "VectorMissing",
            PipelineError::IndexRequired(_) => "IndexRequired",
            PipelineError::BackupCorrupted(_) => "BackupCorrupted",
            PipelineError::StoreUnavailable(_) => "StoreUnavailable",
            PipelineError::EmbedderFailed(_) => "EmbedderFailed",
            PipelineError::ChunkingFailed(_) => "ChunkingFailed",
        }
    }

    /// Structured error envelope for the RPC/tool surface.
    pub fn to_envelope(&self) -> serde_json::Value {
        json!({
            "status": "error",
            "error": self.to_string(),
            "kind": self.kind(),
        })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_and_message() {
        let err = PipelineError::BackupCorrupted("checksum mismatch for documents.json".into());
        let env = err.to_envelope();
        assert_eq!(env["status"], "error");
        assert_eq!(env["kind"], "BackupCorrupted");
        assert!(env["error"].as_str().unwrap().contains("documents.json"));
    }
}
