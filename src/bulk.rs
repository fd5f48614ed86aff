use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::embedder::Embedder;
use crate::error::{PipelineError, Result};
use crate::filter::FilterNode;
use crate::query;
use crate::store::{
    payload_content, payload_meta, scroll_all, scroll_pages, write_payload_meta, Point,
    VectorStore, SCROLL_BATCH_SIZE,
};
use crate::update;

// ---------------------------------------------------------------------------
// Bulk operations, all built on the scroll primitive.
//
// None of these are transactional across points: a bulk update may leave a
// partial prefix updated, and the result envelope quantifies exactly how
// far it got. Per-item failures are collected, not raised; the overall
// status degrades to "error" only when nothing succeeded.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub status: &'static str,
    pub deleted_count: usize,
    pub message: String,
}

/// Delete every point matching the filter: scroll-collect the IDs, then
/// delete in batches. Idempotent: a point that disappears between the
/// scroll and the delete is absorbed as a no-op.
pub fn delete_by_filter(
    store: &dyn VectorStore,
    collection: &str,
    filter: &FilterNode,
) -> Result<DeleteOutcome> {
    let store_filter = filter.to_store_filter()?;

    let mut ids: Vec<Value> = Vec::new();
    scroll_pages(store, collection, Some(&store_filter), false, false, |page| {
        ids.extend(page.into_iter().map(|point| point.id));
        Ok(())
    })?;

    let mut deleted_count = 0usize;
    for batch in ids.chunks(SCROLL_BATCH_SIZE) {
        store.delete(collection, batch)?;
        deleted_count += batch.len();
    }

    Ok(DeleteOutcome {
        status: "success",
        deleted_count,
        message: format!("deleted {deleted_count} documents"),
    })
}

/// Delete an explicit ID list.
pub fn delete_by_ids(store: &dyn VectorStore, collection: &str, ids: &[Value]) -> Result<DeleteOutcome> {
    if ids.is_empty() {
        return Ok(DeleteOutcome {
            status: "success",
            deleted_count: 0,
            message: "no documents to delete".into(),
        });
    }
    for batch in ids.chunks(SCROLL_BATCH_SIZE) {
        store.delete(collection, batch)?;
    }
    Ok(DeleteOutcome {
        status: "success",
        deleted_count: ids.len(),
        message: format!("deleted {} documents", ids.len()),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkUpdateOutcome {
    pub status: &'static str,
    pub updated_count: usize,
    pub errors: Vec<String>,
}

/// Merge a metadata patch into every point matching the filter, preserving
/// each point's payload shape and vector. Not atomic across points;
/// partial progress is possible and reported.
pub fn update_metadata_by_filter(
    store: &dyn VectorStore,
    collection: &str,
    filter: &FilterNode,
    patch: &Map<String, Value>,
) -> Result<BulkUpdateOutcome> {
    let store_filter = filter.to_store_filter()?;

    let mut updated_count = 0usize;
    let mut errors: Vec<String> = Vec::new();

    scroll_pages(store, collection, Some(&store_filter), true, true, |page| {
        let mut to_upsert: Vec<Point> = Vec::new();
        for point in page {
            if point.vector.is_none() {
                // Refuse to overwrite a vector the store declined to return.
                errors.push(format!("{}: vector missing, point skipped", point.id_string()));
                continue;
            }
            let mut meta = payload_meta(&point.payload);
            for (key, value) in patch {
                meta.insert(key.clone(), value.clone());
            }
            let mut payload = point.payload.clone();
            write_payload_meta(&mut payload, meta);
            let mut updated = Point::new(point.id.clone(), payload, None);
            updated.vector = point.vector.clone();
            to_upsert.push(updated);
        }

        if !to_upsert.is_empty() {
            let count = to_upsert.len();
            store.upsert(collection, &to_upsert)?;
            updated_count += count;
        }
        Ok(())
    })?;

    let status = if updated_count == 0 && !errors.is_empty() {
        "error"
    } else {
        "success"
    };
    Ok(BulkUpdateOutcome {
        status,
        updated_count,
        errors,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedDocument {
    pub id: Value,
    pub content: String,
    pub meta: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Serialize the matching points to JSON-compatible records.
pub fn export_documents(
    store: &dyn VectorStore,
    collection: &str,
    filter: Option<&FilterNode>,
    include_embeddings: bool,
) -> Result<Vec<ExportedDocument>> {
    let store_filter = match filter {
        Some(node) => Some(node.to_store_filter()?),
        None => None,
    };
    let points = scroll_all(
        store,
        collection,
        store_filter.as_ref(),
        true,
        include_embeddings,
    )?;

    Ok(points
        .into_iter()
        .map(|point| {
            let embedding = if include_embeddings {
                point
                    .vector
                    .as_ref()
                    .and_then(|v| v.as_plain())
                    .map(<[f32]>::to_vec)
            } else {
                None
            };
            ExportedDocument {
                content: payload_content(&point.payload).to_string(),
                meta: payload_meta(&point.payload),
                embedding,
                id: point.id,
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Skip,
    Update,
    Error,
}

impl DuplicatePolicy {
    pub fn parse(raw: &str) -> Result<DuplicatePolicy> {
        match raw {
            "skip" => Ok(DuplicatePolicy::Skip),
            "update" => Ok(DuplicatePolicy::Update),
            "error" => Ok(DuplicatePolicy::Error),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown duplicate policy: {other} (expected skip | update | error)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub status: &'static str,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub updated_count: usize,
    pub errors: Vec<String>,
    pub total_processed: usize,
}

/// Import a list of `{id?, content, meta, embedding?}` records.
///
/// Each record is looked up by `(doc_id, category)`; the duplicate policy
/// decides what happens on a hit. `update` defers to the single-point
/// update service. New records are embedded when an embedder is provided,
/// or written with their carried embedding; a record with neither is an
/// error entry. Writes happen in batches.
pub fn import_documents(
    store: &dyn VectorStore,
    collection: &str,
    records: &[Value],
    policy: DuplicatePolicy,
    embedder: Option<&dyn Embedder>,
) -> Result<ImportOutcome> {
    let mut imported_count = 0usize;
    let mut skipped_count = 0usize;
    let mut updated_count = 0usize;
    let mut errors: Vec<String> = Vec::new();
    let mut batch: Vec<Point> = Vec::new();

    for (index, record) in records.iter().enumerate() {
        let content = record
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let meta = record
            .get("meta")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let doc_id = meta
            .get("doc_id")
            .or_else(|| record.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(doc_id) = doc_id else {
            errors.push(format!("record {index}: missing doc_id in metadata"));
            continue;
        };
        let category = meta.get("category").and_then(Value::as_str);

        let existing = query::lookup_by_doc_id(store, collection, &doc_id, category, None)?;
        if !existing.is_empty() {
            match policy {
                DuplicatePolicy::Skip => {
                    skipped_count += 1;
                    continue;
                }
                DuplicatePolicy::Error => {
                    errors.push(format!("record {index}: duplicate document found: {doc_id}"));
                    continue;
                }
                DuplicatePolicy::Update => {
                    let Some(embedder) = embedder else {
                        errors.push(format!(
                            "record {index}: duplicate policy 'update' requires an embedder"
                        ));
                        continue;
                    };
                    match update::update_content(
                        store,
                        collection,
                        &existing[0].id,
                        &content,
                        embedder,
                        Some(&meta),
                    ) {
                        Ok(_) => updated_count += 1,
                        Err(e) => errors.push(format!("record {index}: update failed: {e}")),
                    }
                    continue;
                }
            }
        }

        // New record: embed, or reuse the carried embedding.
        let vector: Option<Vec<f32>> = match embedder {
            Some(embedder) => match embedder.embed(&content) {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.push(format!("record {index}: {e}"));
                    continue;
                }
            },
            None => {
                let carried: Option<Vec<f32>> = record
                    .get("embedding")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_f64)
                            .map(|f| f as f32)
                            .collect()
                    });
                match carried {
                    Some(v) if !v.is_empty() => Some(v),
                    _ => {
                        errors.push(format!(
                            "record {index}: no embedder and no carried embedding"
                        ));
                        continue;
                    }
                }
            }
        };

        let id = record
            .get("id")
            .cloned()
            .unwrap_or_else(|| json!(Uuid::new_v4().to_string()));
        let mut payload = Map::new();
        payload.insert("content".into(), json!(content));
        payload.insert("meta".into(), Value::Object(meta));
        batch.push(Point::new(id, payload, vector));

        if batch.len() >= SCROLL_BATCH_SIZE {
            store.upsert(collection, &batch)?;
            imported_count += batch.len();
            batch.clear();
        }
    }

    if !batch.is_empty() {
        store.upsert(collection, &batch)?;
        imported_count += batch.len();
    }

    let processed = imported_count + skipped_count + updated_count;
    let status = if processed == 0 && !errors.is_empty() {
        "error"
    } else {
        "success"
    };
    Ok(ImportOutcome {
        status,
        imported_count,
        skipped_count,
        updated_count,
        errors,
        total_processed: records.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_policy_parsing_is_closed() {
        assert_eq!(DuplicatePolicy::parse("skip").unwrap(), DuplicatePolicy::Skip);
        assert_eq!(DuplicatePolicy::parse("update").unwrap(), DuplicatePolicy::Update);
        assert_eq!(DuplicatePolicy::parse("error").unwrap(), DuplicatePolicy::Error);
        assert_eq!(
            DuplicatePolicy::parse("overwrite").unwrap_err().kind(),
            "InvalidInput"
        );
    }
}
