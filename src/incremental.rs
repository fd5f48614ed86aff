use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::chunker::{self, Chunk, StoredChunk};
use crate::config::ChunkingConfig;
use crate::embedder::Embedder;
use crate::error::{PipelineError, Result};
use crate::query;
use crate::schema::{self, MetadataDraft, STATUS_ACTIVE};
use crate::store::{Point, VectorStore};
use crate::update;

// ---------------------------------------------------------------------------
// Incremental chunked update.
//
// Given a new revision of an existing document, only the chunks whose
// content actually changed are re-embedded: when k of N chunks change,
// exactly k + |new| embedding calls happen. Unchanged chunks keep their
// original point IDs and vectors untouched.
//
// Per-chunk failures are collected and reported; they never abort the rest
// of the batch (upserts are idempotent on stable chunk IDs, so a retry
// converges).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IncrementalUpdateOutcome {
    pub status: &'static str,
    pub total_chunks: usize,
    pub unchanged_count: usize,
    pub changed_count: usize,
    pub new_count: usize,
    pub deleted_count: usize,
    /// Chunk IDs written in this pass (changed + new).
    pub chunk_ids: Vec<String>,
    pub errors: Vec<String>,
    pub message: String,
}

fn write_chunk(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    draft: &MetadataDraft,
    chunk: &Chunk,
    doc_id: &str,
    total_chunks: usize,
) -> Result<()> {
    let mut chunk_draft = draft.clone();
    chunk_draft.hash_content = chunk.hash_content.clone();
    let metadata = schema::build_chunk_metadata(
        &chunk_draft,
        &chunk.chunk_id,
        chunk.chunk_index,
        doc_id,
        total_chunks,
    )?;

    let vector = embedder.embed(&chunk.content)?;
    let mut payload = Map::new();
    payload.insert("content".into(), json!(chunk.content));
    payload.insert("meta".into(), Value::Object(metadata));
    store.upsert(
        collection,
        &[Point::new(json!(Uuid::new_v4().to_string()), payload, Some(vector))],
    )
}

/// Apply a new content revision to an existing chunked document.
///
/// 1. Retrieve the current active chunks of the parent.
/// 2. Chunk the new content.
/// 3. Diff old vs new by chunk index and hash.
/// 4. unchanged → nothing; changed → deprecate old, embed + write new;
///    new → embed + write; deleted → deprecate.
pub fn update_chunked_document(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    content: &str,
    doc_id: &str,
    raw_metadata: &Map<String, Value>,
    params: &ChunkingConfig,
) -> Result<IncrementalUpdateOutcome> {
    let existing_points =
        query::lookup_chunks_by_parent(store, collection, doc_id, Some(STATUS_ACTIVE))?;
    let existing: Vec<StoredChunk> = existing_points
        .into_iter()
        .filter_map(StoredChunk::from_point)
        .collect();

    let new_chunks = chunker::chunk_document(content, doc_id, params)?;
    if new_chunks.is_empty() {
        return Err(PipelineError::ChunkingFailed(format!(
            "no chunks produced for doc '{doc_id}'"
        )));
    }
    let total_chunks = new_chunks.len();

    let diff = chunker::diff_chunks(&existing, &new_chunks);

    let mut draft = base_draft(content, raw_metadata);
    draft.doc_id = doc_id.to_string();

    let mut errors: Vec<String> = Vec::new();
    let mut chunk_ids: Vec<String> = Vec::new();
    let mut changed_count = 0usize;
    let mut new_count = 0usize;
    let mut deleted_count = 0usize;

    // Changed: deprecate the old record first, then write the replacement.
    for chunk in &diff.changed {
        if let Some(old) = existing.iter().find(|o| o.chunk_index == chunk.chunk_index) {
            if let Err(e) = update::deprecate(store, collection, &old.point.id) {
                errors.push(format!("deprecate {}: {e}", chunk.chunk_id));
            }
        }
        match write_chunk(store, embedder, collection, &draft, chunk, doc_id, total_chunks) {
            Ok(()) => {
                changed_count += 1;
                chunk_ids.push(chunk.chunk_id.clone());
            }
            Err(e) => errors.push(format!("write {}: {e}", chunk.chunk_id)),
        }
    }

    for chunk in &diff.new {
        match write_chunk(store, embedder, collection, &draft, chunk, doc_id, total_chunks) {
            Ok(()) => {
                new_count += 1;
                chunk_ids.push(chunk.chunk_id.clone());
            }
            Err(e) => errors.push(format!("write {}: {e}", chunk.chunk_id)),
        }
    }

    for old in &diff.deleted {
        match update::deprecate(store, collection, &old.point.id) {
            Ok(_) => deleted_count += 1,
            Err(e) => errors.push(format!("deprecate index {}: {e}", old.chunk_index)),
        }
    }

    let unchanged_count = diff.unchanged.len();
    let message = format!(
        "incremental update completed: total {total_chunks}, unchanged {unchanged_count} (preserved), \
         changed {changed_count} (updated), new {new_count} (added), deleted {deleted_count} (deprecated)"
    );

    Ok(IncrementalUpdateOutcome {
        status: "success",
        total_chunks,
        unchanged_count,
        changed_count,
        new_count,
        deleted_count,
        chunk_ids,
        errors,
        message,
    })
}

fn base_draft(content: &str, raw_metadata: &Map<String, Value>) -> MetadataDraft {
    // Reuse the ingest engine's raw-field extraction.
    crate::ingest::draft_from_raw(content, raw_metadata)
}
