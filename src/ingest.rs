use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use uuid::Uuid;

use crate::chunker;
use crate::config::ChunkingConfig;
use crate::dedup::{self, StorageAction};
use crate::embedder::Embedder;
use crate::error::{PipelineError, Result};
use crate::fingerprint::{self, Fingerprint};
use crate::query;
use crate::schema::{self, MetadataDraft, DEFAULT_CATEGORY, STATUS_ACTIVE};
use crate::store::{Point, VectorStore};
use crate::update;

// ---------------------------------------------------------------------------
// Ingestion engine: the end-to-end store path for a single document.
//
//   fingerprint → metadata build → duplicate lookup → classify →
//   (skip | deprecate-old) → embed → write
//
// Embedding is a local side effect, so a failure anywhere before the final
// upsert leaves the collection exactly as it was. On update, the old record
// is deprecated before the new one is written.
// ---------------------------------------------------------------------------

/// Result envelope for a single-document ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub status: &'static str,
    pub action: StorageAction,
    pub level: u8,
    /// The resulting point ID (the existing one when the write was skipped).
    pub document_id: Option<String>,
    /// Set when an existing record drove the decision (skip / update).
    pub existing_document_id: Option<String>,
    pub doc_id: String,
    pub category: String,
    pub version: String,
    pub reason: String,
}

/// Pull the schema-known fields out of a raw caller metadata map, leaving
/// the remainder as extra fields. Generates defaults: `doc_id` from the
/// file path or a content-hash stub, `category` = other.
pub(crate) fn draft_from_raw(content: &str, raw: &Map<String, Value>) -> MetadataDraft {
    let get_str = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);

    let file_path = get_str("file_path").or_else(|| get_str("path"));
    let doc_id = get_str("doc_id")
        .or_else(|| file_path.clone())
        .unwrap_or_else(|| {
            let digest = fingerprint::sha256_hex(content.as_bytes());
            format!("doc_{}", &digest[..16])
        });

    let tags = raw
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    const KNOWN_FIELDS: [&str; 10] = [
        "doc_id",
        "category",
        "version",
        "file_path",
        "path",
        "source",
        "repo",
        "tags",
        "status",
        "hash_file",
    ];
    let mut extra = Map::new();
    for (key, value) in raw {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            extra.insert(key.clone(), value.clone());
        }
    }

    MetadataDraft {
        doc_id,
        category: get_str("category").unwrap_or_else(|| DEFAULT_CATEGORY.into()),
        hash_content: String::new(), // filled by the caller
        version: get_str("version"),
        file_path,
        source: get_str("source"),
        repo: get_str("repo"),
        tags,
        hash_file: get_str("hash_file"),
        status: get_str("status"),
        extra,
    }
}

/// Store one document. See the module header for the step sequence.
pub fn store_document(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    content: &str,
    raw_metadata: &Map<String, Value>,
) -> Result<IngestOutcome> {
    if content.is_empty() {
        return Err(PipelineError::InvalidInput("content is required".into()));
    }

    let mut draft = draft_from_raw(content, raw_metadata);
    draft.hash_content = fingerprint::content_hash(content);
    let doc_id = draft.doc_id.clone();

    let mut metadata = schema::build_metadata(&draft)?;

    // Re-derive the metadata hash over the finalized record (extras
    // included) so the stored fingerprint matches what a re-ingest of the
    // same record would compute.
    let metadata_hash = fingerprint::metadata_hash(&metadata);
    metadata.insert("metadata_hash".into(), json!(metadata_hash));

    let fp = Fingerprint {
        content_hash: draft.hash_content.clone(),
        metadata_hash: metadata_hash.clone(),
        composite_key: format!("{}:{metadata_hash}", draft.hash_content),
    };

    // Candidate set: active records under this doc_id, plus any record
    // (active or not) carrying the same content hash.
    let mut candidates =
        query::lookup_by_doc_id(store, collection, &doc_id, None, Some(STATUS_ACTIVE))?;
    for point in query::lookup_by_content_hash(store, collection, &fp.content_hash, None)? {
        if !candidates.iter().any(|c| c.id == point.id) {
            candidates.push(point);
        }
    }

    let (level, matching, reason) =
        dedup::check_duplicate_level(&fp, &candidates, Some(&doc_id), false);
    let action = dedup::decide_storage_action(level);
    let matching_id = matching.map(Point::id_string);

    let category = metadata["category"].as_str().unwrap_or_default().to_string();
    let version = metadata["version"].as_str().unwrap_or_default().to_string();

    match action {
        StorageAction::Skip => {
            return Ok(IngestOutcome {
                status: "success",
                action,
                level,
                document_id: matching_id.clone(),
                existing_document_id: matching_id,
                doc_id,
                category,
                version,
                reason,
            });
        }
        StorageAction::Warn => {
            metadata.insert(
                "warning".into(),
                json!("content is semantically similar to existing documents"),
            );
        }
        StorageAction::Update | StorageAction::Store => {}
    }

    // Embed before any store mutation: a failure here leaves the collection
    // untouched.
    let vector = embedder.embed(content)?;

    let matching_value = matching.map(|p| p.id.clone());
    if action == StorageAction::Update {
        if let Some(old_id) = &matching_value {
            update::deprecate(store, collection, old_id)?;
        }
    }

    let point_id = Uuid::new_v4().to_string();
    let mut payload = Map::new();
    payload.insert("content".into(), json!(content));
    payload.insert("meta".into(), Value::Object(metadata));
    store.upsert(collection, &[Point::new(json!(point_id), payload, Some(vector))])?;

    Ok(IngestOutcome {
        status: "success",
        action,
        level,
        document_id: Some(point_id),
        existing_document_id: matching_id,
        doc_id,
        category,
        version,
        reason,
    })
}

// ---------------------------------------------------------------------------
// File ingestion.
// ---------------------------------------------------------------------------

/// Map a file extension to a language label for code metadata.
pub fn language_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" => "cpp",
        "go" => "go",
        "rs" => "rust",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "scala" => "scala",
        "sql" => "sql",
        "sh" | "bash" => "bash",
        "ps1" => "powershell",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "xml" => "xml",
        "html" => "html",
        "css" => "css",
        "md" => "markdown",
        "toml" => "toml",
        _ => "unknown",
    }
}

fn read_file(file_path: &str) -> Result<String> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(PipelineError::InvalidInput(format!(
            "file not found: {file_path}"
        )));
    }
    std::fs::read_to_string(path)
        .map_err(|e| PipelineError::InvalidInput(format!("failed to read {file_path}: {e}")))
}

/// Ingest a file: read its content, derive `doc_id` from the path, attach
/// file metadata, and run the standard store path.
pub fn store_file(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    file_path: &str,
    extra_metadata: &Map<String, Value>,
) -> Result<IngestOutcome> {
    let content = read_file(file_path)?;
    let path = Path::new(file_path);

    let mut metadata = extra_metadata.clone();
    metadata.insert("file_path".into(), json!(file_path));
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        metadata.insert("file_name".into(), json!(name));
    }

    store_document(store, embedder, collection, &content, &metadata)
}

/// Ingest a code file: language is detected from the extension unless the
/// caller names one; code-specific metadata is attached. The caller routes
/// this at the code collection + code embedder.
pub fn store_code_file(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    file_path: &str,
    language: Option<&str>,
    extra_metadata: &Map<String, Value>,
) -> Result<IngestOutcome> {
    let content = read_file(file_path)?;
    let path = Path::new(file_path);
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let language = match language {
        Some(l) if !l.is_empty() => l.to_string(),
        _ => language_for_extension(extension).to_string(),
    };

    let mut metadata = extra_metadata.clone();
    metadata.insert("file_path".into(), json!(file_path));
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        metadata.insert("file_name".into(), json!(name));
    }
    metadata.insert("file_extension".into(), json!(extension));
    metadata.insert("language".into(), json!(language));
    metadata.insert("content_type".into(), json!("code"));
    metadata.insert("file_size".into(), json!(content.len()));

    store_document(store, embedder, collection, &content, &metadata)
}

// ---------------------------------------------------------------------------
// Chunked store.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChunkedStoreOutcome {
    pub status: &'static str,
    pub total_chunks: usize,
    pub chunk_ids: Vec<String>,
    pub message: String,
}

/// Store a document as chunks (all chunks are new). Each chunk becomes one
/// point with chunk-linkage metadata; the write is a single batch upsert.
pub fn store_chunked_document(
    store: &dyn VectorStore,
    embedder: &dyn Embedder,
    collection: &str,
    content: &str,
    doc_id: &str,
    raw_metadata: &Map<String, Value>,
    params: &ChunkingConfig,
) -> Result<ChunkedStoreOutcome> {
    let chunks = chunker::chunk_document(content, doc_id, params)?;
    if chunks.is_empty() {
        return Err(PipelineError::ChunkingFailed(format!(
            "no chunks produced for doc '{doc_id}'"
        )));
    }

    let mut draft = draft_from_raw(content, raw_metadata);
    draft.doc_id = doc_id.to_string();

    let mut points = Vec::with_capacity(chunks.len());
    let mut chunk_ids = Vec::with_capacity(chunks.len());

    for chunk in &chunks {
        let mut chunk_draft = draft.clone();
        chunk_draft.hash_content = chunk.hash_content.clone();
        let metadata = schema::build_chunk_metadata(
            &chunk_draft,
            &chunk.chunk_id,
            chunk.chunk_index,
            doc_id,
            chunks.len(),
        )?;

        let vector = embedder.embed(&chunk.content)?;
        let mut payload = Map::new();
        payload.insert("content".into(), json!(chunk.content));
        payload.insert("meta".into(), Value::Object(metadata));
        points.push(Point::new(
            json!(Uuid::new_v4().to_string()),
            payload,
            Some(vector),
        ));
        chunk_ids.push(chunk.chunk_id.clone());
    }

    store.upsert(collection, &points)?;

    Ok(ChunkedStoreOutcome {
        status: "success",
        total_chunks: chunks.len(),
        chunk_ids,
        message: format!("chunked document stored with {} chunks", chunks.len()),
    })
}
