use crate::config::Config;
use crate::embedder::{Embedder, StaticModelEmbedder};
use crate::error::{PipelineError, Result};
use crate::store::{ensure_payload_indexes, HttpStore, VectorStore};

// ---------------------------------------------------------------------------
// PipelineContext owns every shared component: configuration, the store
// adapter, and both embedders. There are no module-level singletons; every
// operation receives the context (or the pieces it needs) explicitly.
//
// Initialization order is fixed: config → store adapter → payload-index
// assertion → embedder warmup.
// ---------------------------------------------------------------------------

/// Which collection/model pair an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Docs,
    Code,
}

impl ContentType {
    pub fn parse(raw: &str) -> Result<ContentType> {
        match raw {
            "docs" | "documentation" => Ok(ContentType::Docs),
            "code" => Ok(ContentType::Code),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown content_type: {other} (expected docs | code)"
            ))),
        }
    }
}

pub struct PipelineContext {
    pub config: Config,
    pub store: Box<dyn VectorStore>,
    pub doc_embedder: Box<dyn Embedder>,
    pub code_embedder: Box<dyn Embedder>,
}

impl PipelineContext {
    /// Build a context from the environment: connect the store, assert the
    /// payload indexes on both collections, and warm up both embedders.
    pub fn from_env() -> Result<PipelineContext> {
        let config = Config::from_env()?;
        Self::initialize(config)
    }

    pub fn initialize(config: Config) -> Result<PipelineContext> {
        // Startup chatter goes to stderr; stdout belongs to the protocol.
        eprintln!("[info] connecting to vector store at {}", config.store.url);
        eprintln!(
            "[info] documentation collection: {} ({}d, {})",
            config.collections.documentation, config.embedding.doc_dim, config.embedding.doc_model
        );
        eprintln!(
            "[info] code collection: {} ({}d, {})",
            config.collections.code, config.embedding.code_dim, config.embedding.code_model
        );

        let store = HttpStore::new(&config.store.url, &config.store.api_key);

        for collection in [&config.collections.documentation, &config.collections.code] {
            let report = ensure_payload_indexes(&store, collection);
            eprintln!(
                "[info] payload indexes on {collection}: {} created, {} existing, {} errors",
                report.created.len(),
                report.existing.len(),
                report.errors.len()
            );
        }

        let doc_embedder =
            StaticModelEmbedder::load(&config.embedding.doc_model, config.embedding.doc_dim)?;
        let code_embedder =
            StaticModelEmbedder::load(&config.embedding.code_model, config.embedding.code_dim)?;
        eprintln!("[info] embedders ready");

        Ok(PipelineContext {
            config,
            store: Box::new(store),
            doc_embedder: Box::new(doc_embedder),
            code_embedder: Box::new(code_embedder),
        })
    }

    /// Assemble a context from pre-built components. Used by tests to plug
    /// in an in-memory store and deterministic embedders.
    pub fn with_components(
        config: Config,
        store: Box<dyn VectorStore>,
        doc_embedder: Box<dyn Embedder>,
        code_embedder: Box<dyn Embedder>,
    ) -> PipelineContext {
        PipelineContext {
            config,
            store,
            doc_embedder,
            code_embedder,
        }
    }

    pub fn collection_for(&self, content_type: ContentType) -> &str {
        match content_type {
            ContentType::Docs => &self.config.collections.documentation,
            ContentType::Code => &self.config.collections.code,
        }
    }

    pub fn embedder_for(&self, content_type: ContentType) -> &dyn Embedder {
        match content_type {
            ContentType::Docs => self.doc_embedder.as_ref(),
            ContentType::Code => self.code_embedder.as_ref(),
        }
    }
}
