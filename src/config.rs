use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Environment-driven configuration.
//
// The store endpoint and credential are required; everything else has a
// default. Initialization order is explicit and lives in context.rs:
// config → store adapter → index assertion → embedder warmup.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Endpoint of the external vector store.
    pub url: String,
    /// Credential sent as the `api-key` header on every request.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionsConfig {
    /// Collection holding prose / documentation points.
    pub documentation: String,
    /// Collection holding code points (different model + dimension).
    pub code: String,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            documentation: "haystack_mcp".to_string(),
            code: "haystack_mcp_code".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub doc_model: String,
    pub doc_dim: usize,
    pub code_model: String,
    pub code_dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            // Fast text model for documentation.
            doc_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            doc_dim: 384,
            // Larger code-aware model; the extra dimensions pay off on code.
            code_model: "sentence-transformers/all-mpnet-base-v2".to_string(),
            code_dim: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in tokens.
    pub chunk_overlap: usize,
    /// Cheap token estimate: characters per token.
    pub chars_per_token: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            chars_per_token: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub collections: CollectionsConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    /// Where backup directories are created.
    pub backup_dir: PathBuf,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_backup_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".vectorloom").join("backups"))
        .unwrap_or_else(|| PathBuf::from("./backups"))
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Recognized keys: VECTOR_STORE_URL (required), VECTOR_STORE_API_KEY
    /// (required), DOC_COLLECTION, CODE_COLLECTION, DOC_EMBEDDING_MODEL,
    /// DOC_EMBEDDING_DIM, CODE_EMBEDDING_MODEL, CODE_EMBEDDING_DIM.
    pub fn from_env() -> Result<Config> {
        let url = env_nonempty("VECTOR_STORE_URL").ok_or_else(|| {
            PipelineError::InvalidInput(
                "VECTOR_STORE_URL environment variable must be set".to_string(),
            )
        })?;
        let api_key = env_nonempty("VECTOR_STORE_API_KEY").ok_or_else(|| {
            PipelineError::InvalidInput(
                "VECTOR_STORE_API_KEY environment variable must be set".to_string(),
            )
        })?;

        let mut collections = CollectionsConfig::default();
        if let Some(c) = env_nonempty("DOC_COLLECTION") {
            collections.documentation = c;
        }
        if let Some(c) = env_nonempty("CODE_COLLECTION") {
            collections.code = c;
        }

        let mut embedding = EmbeddingConfig::default();
        if let Some(m) = env_nonempty("DOC_EMBEDDING_MODEL") {
            embedding.doc_model = m;
        }
        if let Some(d) = env_nonempty("DOC_EMBEDDING_DIM").and_then(|v| v.parse().ok()) {
            embedding.doc_dim = d;
        }
        if let Some(m) = env_nonempty("CODE_EMBEDDING_MODEL") {
            embedding.code_model = m;
        }
        if let Some(d) = env_nonempty("CODE_EMBEDDING_DIM").and_then(|v| v.parse().ok()) {
            embedding.code_dim = d;
        }

        Ok(Config {
            store: StoreConfig { url, api_key },
            collections,
            embedding,
            chunking: ChunkingConfig::default(),
            backup_dir: default_backup_dir(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let collections = CollectionsConfig::default();
        assert_eq!(collections.documentation, "haystack_mcp");
        assert_eq!(collections.code, "haystack_mcp_code");

        let embedding = EmbeddingConfig::default();
        assert_eq!(embedding.doc_dim, 384);
        assert_eq!(embedding.code_dim, 768);

        let chunking = ChunkingConfig::default();
        assert_eq!(chunking.chunk_size, 512);
        assert_eq!(chunking.chunk_overlap, 50);
    }
}
