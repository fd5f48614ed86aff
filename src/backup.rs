use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use crate::bulk::{self, ExportedDocument};
use crate::embedder::Embedder;
use crate::error::{PipelineError, Result};
use crate::filter;
use crate::fingerprint;
use crate::schema;
use crate::store::{Point, VectorStore, SCROLL_BATCH_SIZE};
use crate::verify;

// ---------------------------------------------------------------------------
// Local backup & integrity-checked restore.
//
// A backup is a timestamped directory:
//
//   backup_<collection>_<YYYYMMDD_HHMMSS>/
//     documents.json        points of the documentation collection
//     code_documents.json   points of the code collection (when backed up)
//     metadata.json         backup-wide record
//     manifest.json         per-file SHA-256 checksums and sizes
//
// Restore recomputes every file checksum against the manifest and aborts
// with BackupCorrupted before any write to the store.
// ---------------------------------------------------------------------------

pub const BACKUP_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub status: &'static str,
    pub backup_path: String,
    pub backup_id: String,
    pub document_count: usize,
    pub documentation_count: usize,
    pub code_count: usize,
}

fn write_json_file(path: &Path, value: &Value) -> Result<(String, u64)> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::InvalidInput(format!("failed to serialize backup: {e}")))?;
    std::fs::write(path, &bytes).map_err(|e| {
        PipelineError::InvalidInput(format!("failed to write {}: {e}", path.display()))
    })?;
    Ok((fingerprint::sha256_hex(&bytes), bytes.len() as u64))
}

fn export_as_value(
    store: &dyn VectorStore,
    collection: &str,
    filters: Option<&Value>,
    include_embeddings: bool,
) -> Result<(Value, usize)> {
    let parsed = match filters {
        Some(raw) => Some(filter::FilterNode::parse(raw)?),
        None => None,
    };
    let documents: Vec<ExportedDocument> =
        bulk::export_documents(store, collection, parsed.as_ref(), include_embeddings)?;
    let count = documents.len();
    let value = serde_json::to_value(&documents)
        .map_err(|e| PipelineError::InvalidInput(format!("failed to serialize export: {e}")))?;
    Ok((value, count))
}

/// Create a local backup of the documentation collection and, when named,
/// the code collection. The backup directory is created exclusively under
/// a timestamped name so concurrent backups never collide.
pub fn create_backup(
    store: &dyn VectorStore,
    doc_collection: &str,
    code_collection: Option<&str>,
    backup_directory: &Path,
    include_embeddings: bool,
    filters: Option<&Value>,
) -> Result<BackupOutcome> {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup_id = format!("backup_{doc_collection}_{timestamp}");
    let backup_path = backup_directory.join(&backup_id);

    std::fs::create_dir_all(backup_directory).map_err(|e| {
        PipelineError::InvalidInput(format!(
            "failed to create backup directory {}: {e}",
            backup_directory.display()
        ))
    })?;
    std::fs::create_dir(&backup_path).map_err(|e| {
        PipelineError::InvalidInput(format!(
            "failed to create {}: {e}",
            backup_path.display()
        ))
    })?;

    let (docs_value, docs_count) =
        export_as_value(store, doc_collection, filters, include_embeddings)?;
    let (docs_checksum, docs_size) =
        write_json_file(&backup_path.join("documents.json"), &docs_value)?;

    let mut manifest_files = vec![json!({
        "filename": "documents.json",
        "checksum": docs_checksum,
        "size": docs_size,
    })];

    // The code collection is best-effort: a failure there still leaves a
    // valid documentation backup.
    let mut code_count = 0usize;
    let mut code_entry: Option<Value> = None;
    if let Some(code) = code_collection {
        match export_as_value(store, code, filters, include_embeddings) {
            Ok((code_value, count)) => {
                let (checksum, size) =
                    write_json_file(&backup_path.join("code_documents.json"), &code_value)?;
                code_count = count;
                code_entry = Some(json!({
                    "filename": "code_documents.json",
                    "checksum": checksum,
                    "size": size,
                }));
            }
            Err(e) => {
                crate::debug_log!("[vectorloom] code collection backup failed: {e}");
            }
        }
    }

    let mut collections = json!({
        "documentation": { "collection_name": doc_collection, "document_count": docs_count }
    });
    if code_count > 0 {
        if let Some(code) = code_collection {
            collections["code"] =
                json!({ "collection_name": code, "document_count": code_count });
        }
    }

    let backup_metadata = json!({
        "backup_id": backup_id,
        "collections": collections,
        "timestamp": schema::utc_timestamp(),
        "document_count": docs_count + code_count,
        "documentation_count": docs_count,
        "code_count": code_count,
        "include_embeddings": include_embeddings,
        "filters_applied": filters.is_some(),
        "filters": filters,
        "backup_version": BACKUP_VERSION,
    });
    let (metadata_checksum, metadata_size) =
        write_json_file(&backup_path.join("metadata.json"), &backup_metadata)?;
    manifest_files.push(json!({
        "filename": "metadata.json",
        "checksum": metadata_checksum,
        "size": metadata_size,
    }));
    if let Some(entry) = code_entry {
        manifest_files.push(entry);
    }

    let manifest = json!({
        "backup_id": backup_id,
        "files": manifest_files,
        "created_at": schema::utc_timestamp(),
    });
    write_json_file(&backup_path.join("manifest.json"), &manifest)?;

    Ok(BackupOutcome {
        status: "success",
        backup_path: backup_path.to_string_lossy().into_owned(),
        backup_id,
        document_count: docs_count + code_count,
        documentation_count: docs_count,
        code_count,
    })
}

/// Recompute every file checksum named in the manifest. Any divergence is
/// `BackupCorrupted`; the caller must not have written anything yet.
pub fn verify_backup_integrity(backup_dir: &Path, manifest: &Value) -> Result<()> {
    let files = manifest
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::BackupCorrupted("manifest has no file list".into()))?;

    for entry in files {
        let filename = entry
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let expected = entry
            .get("checksum")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let path = backup_dir.join(filename);
        let bytes = std::fs::read(&path).map_err(|_| {
            PipelineError::BackupCorrupted(format!("file not found: {filename}"))
        })?;
        let actual = fingerprint::sha256_hex(&bytes);
        if actual != expected {
            return Err(PipelineError::BackupCorrupted(format!(
                "checksum mismatch for {filename}: expected {}…, got {}…",
                &expected[..16.min(expected.len())],
                &actual[..16.min(actual.len())]
            )));
        }
    }
    Ok(())
}

fn read_json_file(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path).map_err(|_| {
        PipelineError::BackupCorrupted(format!("missing backup file: {}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        PipelineError::BackupCorrupted(format!("malformed {}: {e}", path.display()))
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub status: &'static str,
    pub backup_id: Option<String>,
    pub restored_count: usize,
    pub documentation_restored: usize,
    pub code_restored: usize,
    pub skipped_count: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Value>,
}

fn existing_point_ids(store: &dyn VectorStore, collection: &str) -> Result<std::collections::HashSet<String>> {
    let mut ids = std::collections::HashSet::new();
    crate::store::scroll_pages(store, collection, None, false, false, |page| {
        ids.extend(page.iter().map(Point::id_string));
        Ok(())
    })?;
    Ok(ids)
}

fn restore_collection(
    store: &dyn VectorStore,
    collection: &str,
    records: &[Value],
    skip_existing: bool,
    embedder: Option<&dyn Embedder>,
) -> Result<(usize, usize, Vec<String>)> {
    let existing = if skip_existing {
        existing_point_ids(store, collection)?
    } else {
        Default::default()
    };

    let mut restored = 0usize;
    let mut skipped = 0usize;
    let mut errors: Vec<String> = Vec::new();
    let mut batch: Vec<Point> = Vec::new();

    for record in records {
        let id = record.get("id").cloned().unwrap_or(Value::Null);
        let id_string = match &id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if skip_existing && existing.contains(&id_string) {
            skipped += 1;
            continue;
        }

        let content = record
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let meta = record
            .get("meta")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // Prefer the stored embedding; regenerate through the embedder when
        // the backup carries none.
        let carried: Option<Vec<f32>> = record
            .get("embedding")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_f64).map(|f| f as f32).collect())
            .filter(|v: &Vec<f32>| !v.is_empty());

        let vector = match carried {
            Some(v) => v,
            None => match embedder {
                Some(embedder) => match embedder.embed(content) {
                    Ok(v) => v,
                    Err(e) => {
                        errors.push(format!("{id_string}: {e}"));
                        continue;
                    }
                },
                None => {
                    errors.push(format!(
                        "{id_string}: backup has no embedding and no embedder was provided"
                    ));
                    continue;
                }
            },
        };

        let mut payload = Map::new();
        payload.insert("content".into(), json!(content));
        payload.insert("meta".into(), Value::Object(meta));
        batch.push(Point::new(id, payload, Some(vector)));

        if batch.len() >= SCROLL_BATCH_SIZE {
            store.upsert(collection, &batch)?;
            restored += batch.len();
            batch.clear();
        }
    }

    if !batch.is_empty() {
        store.upsert(collection, &batch)?;
        restored += batch.len();
    }

    Ok((restored, skipped, errors))
}

fn verify_restored_sample(store: &dyn VectorStore, collection: &str, sample_size: usize) -> Value {
    let sample = store
        .scroll(collection, None, sample_size, None, true, false)
        .map(|(points, _)| points)
        .unwrap_or_default();
    let verified = sample
        .iter()
        .filter(|p| verify::verify_content_quality(p).status == "pass")
        .count();
    json!({
        "sample_size": sample.len(),
        "verified_count": verified,
        "failed_count": sample.len() - verified,
    })
}

/// Restore a backup into the given collections.
///
/// Integrity is established first: every file checksum must match the
/// manifest before a single point is written. `skip_existing` keeps points
/// whose IDs already exist in the target collection.
#[allow(clippy::too_many_arguments)]
pub fn restore_backup(
    store: &dyn VectorStore,
    backup_path: &Path,
    doc_collection: &str,
    code_collection: Option<&str>,
    skip_existing: bool,
    doc_embedder: Option<&dyn Embedder>,
    code_embedder: Option<&dyn Embedder>,
    verify_after_restore: bool,
) -> Result<RestoreOutcome> {
    if !backup_path.is_dir() {
        return Err(PipelineError::InvalidInput(format!(
            "backup directory not found: {}",
            backup_path.display()
        )));
    }

    let manifest = read_json_file(&backup_path.join("manifest.json"))?;
    verify_backup_integrity(backup_path, &manifest)?;

    let backup_metadata = read_json_file(&backup_path.join("metadata.json"))?;
    let documents = read_json_file(&backup_path.join("documents.json"))?;
    let documents = documents
        .as_array()
        .cloned()
        .ok_or_else(|| PipelineError::BackupCorrupted("documents.json is not an array".into()))?;

    let (docs_restored, docs_skipped, mut errors) =
        restore_collection(store, doc_collection, &documents, skip_existing, doc_embedder)?;

    let mut code_restored = 0usize;
    let mut code_skipped = 0usize;
    let code_file = backup_path.join("code_documents.json");
    if code_file.is_file() {
        if let Some(code) = code_collection {
            let code_documents = read_json_file(&code_file)?;
            let code_documents = code_documents.as_array().cloned().ok_or_else(|| {
                PipelineError::BackupCorrupted("code_documents.json is not an array".into())
            })?;
            let (restored, skipped, code_errors) = restore_collection(
                store,
                code,
                &code_documents,
                skip_existing,
                code_embedder.or(doc_embedder),
            )?;
            code_restored = restored;
            code_skipped = skipped;
            errors.extend(code_errors);
        }
    }

    let verification = verify_after_restore.then(|| {
        let mut results = json!({});
        if docs_restored > 0 {
            results["documentation"] =
                verify_restored_sample(store, doc_collection, docs_restored.min(100));
        }
        if code_restored > 0 {
            if let Some(code) = code_collection {
                results["code"] = verify_restored_sample(store, code, code_restored.min(100));
            }
        }
        results
    });

    Ok(RestoreOutcome {
        status: "success",
        backup_id: backup_metadata
            .get("backup_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        restored_count: docs_restored + code_restored,
        documentation_restored: docs_restored,
        code_restored,
        skipped_count: docs_skipped + code_skipped,
        errors,
        verification,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub backup_id: String,
    pub backup_path: String,
    pub timestamp: String,
    pub document_count: usize,
    pub include_embeddings: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupListing {
    pub status: &'static str,
    pub backups: Vec<BackupSummary>,
    pub total_backups: usize,
}

/// Enumerate the backups under a directory, newest first. Entries with a
/// missing or unreadable manifest/metadata are skipped.
pub fn list_backups(backup_directory: &Path) -> Result<BackupListing> {
    let mut backups: Vec<BackupSummary> = Vec::new();

    if backup_directory.is_dir() {
        let entries = std::fs::read_dir(backup_directory).map_err(|e| {
            PipelineError::InvalidInput(format!(
                "failed to read {}: {e}",
                backup_directory.display()
            ))
        })?;
        for entry in entries.flatten() {
            let path: PathBuf = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() || !name.starts_with("backup_") {
                continue;
            }
            if !path.join("manifest.json").is_file() {
                continue;
            }
            let Ok(metadata) = read_json_file(&path.join("metadata.json")) else {
                continue;
            };
            backups.push(BackupSummary {
                backup_id: metadata
                    .get("backup_id")
                    .and_then(Value::as_str)
                    .unwrap_or(&name)
                    .to_string(),
                backup_path: path.to_string_lossy().into_owned(),
                timestamp: metadata
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                document_count: metadata
                    .get("document_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
                include_embeddings: metadata
                    .get("include_embeddings")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let total_backups = backups.len();
    Ok(BackupListing {
        status: "success",
        backups,
        total_backups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> String {
        std::fs::write(dir.join(name), bytes).unwrap();
        fingerprint::sha256_hex(bytes)
    }

    #[test]
    fn integrity_check_accepts_matching_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let checksum = write_file(dir.path(), "documents.json", b"[]");
        let manifest = json!({
            "files": [{ "filename": "documents.json", "checksum": checksum, "size": 2 }]
        });
        verify_backup_integrity(dir.path(), &manifest).unwrap();
    }

    #[test]
    fn integrity_check_rejects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let checksum = write_file(dir.path(), "documents.json", b"[]");
        // Tamper with a single byte after the manifest was cut.
        std::fs::write(dir.path().join("documents.json"), b"[}").unwrap();
        let manifest = json!({
            "files": [{ "filename": "documents.json", "checksum": checksum, "size": 2 }]
        });
        let err = verify_backup_integrity(dir.path(), &manifest).unwrap_err();
        assert_eq!(err.kind(), "BackupCorrupted");
    }

    #[test]
    fn integrity_check_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = json!({
            "files": [{ "filename": "ghost.json", "checksum": "abc", "size": 1 }]
        });
        let err = verify_backup_integrity(dir.path(), &manifest).unwrap_err();
        assert_eq!(err.kind(), "BackupCorrupted");
    }

    #[test]
    fn list_backups_skips_corrupted_entries_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();

        for (name, stamp) in [("backup_c_20250101_000000", "2025-01-01T00:00:00Z"),
                              ("backup_c_20250601_000000", "2025-06-01T00:00:00Z")] {
            let path = dir.path().join(name);
            std::fs::create_dir(&path).unwrap();
            std::fs::write(path.join("manifest.json"), b"{}").unwrap();
            std::fs::write(
                path.join("metadata.json"),
                serde_json::to_vec(&json!({
                    "backup_id": name,
                    "timestamp": stamp,
                    "document_count": 3,
                }))
                .unwrap(),
            )
            .unwrap();
        }
        // A directory without a manifest is not a backup.
        std::fs::create_dir(dir.path().join("backup_broken")).unwrap();

        let listing = list_backups(dir.path()).unwrap();
        assert_eq!(listing.total_backups, 2);
        assert_eq!(listing.backups[0].backup_id, "backup_c_20250601_000000");
    }

    #[test]
    fn listing_a_missing_directory_is_empty_not_an_error() {
        let listing = list_backups(Path::new("/definitely/not/here")).unwrap();
        assert_eq!(listing.total_backups, 0);
    }
}
