use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::fingerprint;

// ---------------------------------------------------------------------------
// Canonical metadata schema.
//
// Every stored record carries the required fields below; the enumerated
// fields are closed sets checked at build and validation time. All readers
// of the category/source/status vocabularies import from here.
// ---------------------------------------------------------------------------

/// Fields every stored record must carry, non-empty.
pub const REQUIRED_METADATA_FIELDS: [&str; 4] = ["doc_id", "version", "category", "hash_content"];

/// Fields excluded from the metadata hash so re-ingesting the same logical
/// record at a later time keeps its fingerprint stable.
pub const VOLATILE_METADATA_FIELDS: [&str; 4] = ["created_at", "updated_at", "status", "version"];

pub const VALID_CATEGORIES: [&str; 7] = [
    "user_rule",
    "project_rule",
    "project_command",
    "design_doc",
    "debug_summary",
    "test_pattern",
    "other",
];

pub const VALID_SOURCES: [&str; 3] = ["manual", "generated", "imported"];

pub const VALID_STATUSES: [&str; 3] = ["active", "deprecated", "draft"];

/// Categories whose records originate from files and must carry `file_path`.
pub const FILE_BACKED_CATEGORIES: [&str; 3] = ["user_rule", "project_rule", "project_command"];

pub const DEFAULT_CATEGORY: &str = "other";
pub const DEFAULT_SOURCE: &str = "manual";
pub const DEFAULT_STATUS: &str = "active";
pub const DEFAULT_REPO: &str = "vectorloom";

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DEPRECATED: &str = "deprecated";

/// Placeholder patterns that mark incomplete content during verification.
/// The normalization layer strips a smaller subset (see fingerprint.rs);
/// verification flags the full list.
pub const PLACEHOLDER_PATTERNS: [&str; 14] = [
    r"(?i)\[Full content from file\.\.\.\]",
    r"(?i)\[Full content\.\.\.\]",
    r"(?i)\[\.\.\.\]",
    r"(?i)\[TODO:.*?\]",
    r"(?i)\[TBD:.*?\]",
    r"(?i)\[PLACEHOLDER:.*?\]",
    r"(?i)\[WRITE HERE\]",
    r"(?i)\[CONTENT TO BE ADDED\]",
    r"(?i)placeholder",
    r"(?i)will be stored",
    r"(?i)content will be",
    r"(?i)to be filled",
    r"(?i)to be added",
    r"(?i)to be completed",
];

/// Current UTC instant as ISO-8601 with a trailing `Z`.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Inputs for building a canonical metadata record. Optional fields fall
/// back to the schema defaults.
#[derive(Debug, Clone, Default)]
pub struct MetadataDraft {
    pub doc_id: String,
    pub category: String,
    pub hash_content: String,
    pub version: Option<String>,
    pub file_path: Option<String>,
    pub source: Option<String>,
    pub repo: Option<String>,
    pub tags: Vec<String>,
    pub hash_file: Option<String>,
    pub status: Option<String>,
    /// Extra caller-supplied fields, merged last. They do not participate in
    /// the builder's metadata hash (the ingest engine re-derives the hash
    /// over the finalized record).
    pub extra: Map<String, Value>,
}

fn check_enum(field: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(PipelineError::InvalidMetadata(format!(
        "{field} must be one of {allowed:?}, got: {value}"
    )))
}

/// Build a fully populated metadata record from a draft.
///
/// Generates timestamps, fills defaults, computes `metadata_hash` over the
/// stable subset, and writes the backward-compatibility aliases
/// (`content_hash` for `hash_content`, `path` for `file_path`). `version`
/// defaults to the creation timestamp. When the draft names a `file_path`
/// pointing at a readable file and no `hash_file` was given, the raw file
/// bytes are hashed into `hash_file`.
pub fn build_metadata(draft: &MetadataDraft) -> Result<Map<String, Value>> {
    if draft.doc_id.is_empty() {
        return Err(PipelineError::InvalidMetadata(
            "doc_id is required and cannot be empty".into(),
        ));
    }
    if draft.category.is_empty() {
        return Err(PipelineError::InvalidMetadata(
            "category is required and cannot be empty".into(),
        ));
    }
    check_enum("category", &draft.category, &VALID_CATEGORIES)?;
    if draft.hash_content.is_empty() {
        return Err(PipelineError::InvalidMetadata(
            "hash_content is required and cannot be empty".into(),
        ));
    }

    let source = draft.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.into());
    check_enum("source", &source, &VALID_SOURCES)?;
    let status = draft.status.clone().unwrap_or_else(|| DEFAULT_STATUS.into());
    check_enum("status", &status, &VALID_STATUSES)?;

    let now = utc_timestamp();
    let version = draft.version.clone().unwrap_or_else(|| now.clone());
    let repo = draft.repo.clone().unwrap_or_else(|| DEFAULT_REPO.into());

    let mut metadata = Map::new();
    metadata.insert("doc_id".into(), json!(draft.doc_id));
    metadata.insert("version".into(), json!(version));
    metadata.insert("category".into(), json!(draft.category));
    metadata.insert("hash_content".into(), json!(draft.hash_content));
    metadata.insert("source".into(), json!(source));
    metadata.insert("repo".into(), json!(repo));
    metadata.insert("status".into(), json!(status));
    metadata.insert("created_at".into(), json!(now));
    metadata.insert("updated_at".into(), json!(now));
    metadata.insert("tags".into(), json!(draft.tags));

    if let Some(file_path) = &draft.file_path {
        metadata.insert("file_path".into(), json!(file_path));
        // `path` alias kept so downstream consumers unaware of the newer
        // field name keep working.
        metadata.insert("path".into(), json!(file_path));
    }

    let hash_file = match &draft.hash_file {
        Some(h) => Some(h.clone()),
        None => draft.file_path.as_deref().and_then(hash_file_bytes),
    };
    if let Some(h) = hash_file {
        metadata.insert("hash_file".into(), json!(h));
    }

    metadata.insert(
        "metadata_hash".into(),
        json!(fingerprint::metadata_hash(&metadata)),
    );
    // Alias for readers that predate the hash_content field name.
    metadata.insert("content_hash".into(), json!(draft.hash_content));

    for (key, value) in &draft.extra {
        metadata.insert(key.clone(), value.clone());
    }

    Ok(metadata)
}

/// SHA-256 of the raw bytes of a file on disk; `None` when unreadable.
fn hash_file_bytes(file_path: &str) -> Option<String> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return None;
    }
    std::fs::read(path).ok().map(|bytes| fingerprint::sha256_hex(&bytes))
}

/// Chunk-specific metadata: the chunk uses its chunk_id as storage doc_id
/// and carries the linkage back to its parent.
pub fn build_chunk_metadata(
    draft: &MetadataDraft,
    chunk_id: &str,
    chunk_index: usize,
    parent_doc_id: &str,
    total_chunks: usize,
) -> Result<Map<String, Value>> {
    let mut chunk_draft = draft.clone();
    chunk_draft.doc_id = chunk_id.to_string();
    let mut metadata = build_metadata(&chunk_draft)?;
    metadata.insert("chunk_id".into(), json!(chunk_id));
    metadata.insert("chunk_index".into(), json!(chunk_index));
    metadata.insert("parent_doc_id".into(), json!(parent_doc_id));
    metadata.insert("is_chunk".into(), json!(true));
    metadata.insert("total_chunks".into(), json!(total_chunks));
    // Re-derive the hash so it covers the chunk linkage fields: a stored
    // chunk re-fingerprints to exactly its stored metadata_hash.
    metadata.insert(
        "metadata_hash".into(),
        json!(fingerprint::metadata_hash(&metadata)),
    );
    Ok(metadata)
}

/// Validate a metadata record against the schema: required fields present
/// and non-empty, enumerated fields inside their closed sets.
pub fn validate_metadata(metadata: &Map<String, Value>) -> Result<()> {
    for field in REQUIRED_METADATA_FIELDS {
        let value = metadata.get(field).ok_or_else(|| {
            PipelineError::InvalidMetadata(format!("required field '{field}' is missing"))
        })?;
        let empty = match value {
            Value::String(s) => s.is_empty(),
            Value::Null => true,
            _ => false,
        };
        if empty {
            return Err(PipelineError::InvalidMetadata(format!(
                "required field '{field}' cannot be empty"
            )));
        }
    }

    if let Some(category) = metadata.get("category").and_then(Value::as_str) {
        check_enum("category", category, &VALID_CATEGORIES)?;
    }
    if let Some(source) = metadata.get("source").and_then(Value::as_str) {
        check_enum("source", source, &VALID_SOURCES)?;
    }
    if let Some(status) = metadata.get("status").and_then(Value::as_str) {
        check_enum("status", status, &VALID_STATUSES)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(doc_id: &str, category: &str) -> MetadataDraft {
        MetadataDraft {
            doc_id: doc_id.into(),
            category: category.into(),
            hash_content: "abc123".into(),
            ..Default::default()
        }
    }

    #[test]
    fn builder_fills_defaults_and_aliases() {
        let meta = build_metadata(&draft("d1", "user_rule")).unwrap();
        assert_eq!(meta["source"], "manual");
        assert_eq!(meta["status"], "active");
        assert_eq!(meta["repo"], DEFAULT_REPO);
        assert_eq!(meta["content_hash"], meta["hash_content"]);
        assert!(meta["created_at"].as_str().unwrap().ends_with('Z'));
        // version defaults to the creation timestamp
        assert_eq!(meta["version"], meta["created_at"]);
        assert!(meta.contains_key("metadata_hash"));
        validate_metadata(&meta).unwrap();
    }

    #[test]
    fn builder_rejects_unknown_category() {
        let err = build_metadata(&draft("d1", "nonsense")).unwrap_err();
        assert_eq!(err.kind(), "InvalidMetadata");
    }

    #[test]
    fn builder_rejects_empty_doc_id() {
        let err = build_metadata(&draft("", "other")).unwrap_err();
        assert_eq!(err.kind(), "InvalidMetadata");
    }

    #[test]
    fn builder_rejects_unknown_source_and_status() {
        let mut d = draft("d1", "other");
        d.source = Some("scraped".into());
        assert_eq!(build_metadata(&d).unwrap_err().kind(), "InvalidMetadata");

        let mut d = draft("d1", "other");
        d.status = Some("archived".into());
        assert_eq!(build_metadata(&d).unwrap_err().kind(), "InvalidMetadata");
    }

    #[test]
    fn file_path_writes_path_alias() {
        let mut d = draft("d1", "user_rule");
        d.file_path = Some("rules/style.md".into());
        let meta = build_metadata(&d).unwrap();
        assert_eq!(meta["file_path"], "rules/style.md");
        assert_eq!(meta["path"], "rules/style.md");
    }

    #[test]
    fn extras_merge_after_hash() {
        let mut d = draft("d1", "other");
        d.extra.insert("language".into(), json!("rust"));
        let meta = build_metadata(&d).unwrap();
        assert_eq!(meta["language"], "rust");

        // The builder hash covers the base record only; extras land after.
        let plain = build_metadata(&draft("d1", "other")).unwrap();
        assert_eq!(meta["metadata_hash"], plain["metadata_hash"]);
    }

    #[test]
    fn chunk_metadata_links_parent() {
        let meta = build_chunk_metadata(&draft("ignored", "other"), "d1_chunk_2", 2, "d1", 5).unwrap();
        assert_eq!(meta["doc_id"], "d1_chunk_2");
        assert_eq!(meta["chunk_id"], "d1_chunk_2");
        assert_eq!(meta["chunk_index"], 2);
        assert_eq!(meta["parent_doc_id"], "d1");
        assert_eq!(meta["is_chunk"], true);
        assert_eq!(meta["total_chunks"], 5);
    }

    #[test]
    fn validate_flags_missing_required_field() {
        let mut meta = build_metadata(&draft("d1", "other")).unwrap();
        meta.remove("version");
        assert_eq!(validate_metadata(&meta).unwrap_err().kind(), "InvalidMetadata");
    }
}
