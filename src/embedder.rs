use model2vec_rs::model::StaticModel;

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Embedding models are black boxes to the pipeline: text in, fixed-dimension
// vector out. The two collections carry different models (a fast text model
// for documentation, a larger code-aware model for code); both sit behind
// this trait so the pipeline never touches model internals and tests can
// substitute deterministic counting embedders.
//
// The trait deliberately has no Send/Sync bound: the underlying static
// model is not reentrant, and the pipeline is single-threaded per operation.
// ---------------------------------------------------------------------------

pub trait Embedder {
    /// Vector dimension this embedder produces.
    fn dim(&self) -> usize;

    /// Embed a document/passage.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a search query. Models with asymmetric passage/query encodings
    /// override this; the default reuses `embed`.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text)
    }
}

/// Embedder backed by a Model2Vec static model pulled from the HuggingFace
/// Hub. Loaded once at startup and reused for the life of the process.
pub struct StaticModelEmbedder {
    model: StaticModel,
    model_id: String,
    dim: usize,
}

impl StaticModelEmbedder {
    pub fn load(model_id: &str, dim: usize) -> Result<StaticModelEmbedder> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| PipelineError::EmbedderFailed(format!("failed to load {model_id}: {e}")))?;
        Ok(StaticModelEmbedder {
            model,
            model_id: model_id.to_string(),
            dim,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Embedder for StaticModelEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.model.encode_single(&format!("passage: {text}"));
        if vector.is_empty() {
            return Err(PipelineError::EmbedderFailed(format!(
                "{} produced an empty vector",
                self.model_id
            )));
        }
        Ok(vector)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.model.encode_single(&format!("query: {text}"));
        if vector.is_empty() {
            return Err(PipelineError::EmbedderFailed(format!(
                "{} produced an empty vector",
                self.model_id
            )));
        }
        Ok(vector)
    }
}
