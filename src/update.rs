use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::embedder::Embedder;
use crate::error::{PipelineError, Result};
use crate::fingerprint;
use crate::query;
use crate::schema::{self, STATUS_DEPRECATED};
use crate::store::{payload_meta, payload_meta_field, write_payload_meta, Point, VectorStore};

// ---------------------------------------------------------------------------
// Single-point update service.
//
// The store has no partial-update primitive we can trust across payload
// shapes, so every update is a retrieve → rewrite → single upsert on the
// same point ID. The upsert is atomic: an interrupted call leaves either
// the pre-state or the post-state, never a mixed vector+payload.
//
// Writes preserve whichever payload shape (nested `meta` object vs flat
// top-level fields) the existing point used.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub status: &'static str,
    pub document_id: String,
    pub message: String,
    pub updated_fields: Vec<String>,
}

fn retrieve_single(
    store: &dyn VectorStore,
    collection: &str,
    point_id: &Value,
    with_vectors: bool,
) -> Result<Point> {
    let points = store.retrieve(collection, std::slice::from_ref(point_id), true, with_vectors)?;
    points
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::NotFound(format!("document not found: {point_id}")))
}

/// Refresh a metadata record after an edit: bump `updated_at` and
/// recompute `metadata_hash` over the stable subset. The exclusions are
/// the same for both payload shapes (payload_meta already strips the
/// flat shape's non-metadata fields).
fn refresh_meta(meta: &mut Map<String, Value>) {
    meta.insert("updated_at".into(), json!(schema::utc_timestamp()));
    let hash = fingerprint::metadata_hash(meta);
    meta.insert("metadata_hash".into(), json!(hash));
}

/// Atomically replace a point's content: recompute the content hash, apply
/// the optional metadata patch, re-embed, and upsert under the same ID.
pub fn update_content(
    store: &dyn VectorStore,
    collection: &str,
    point_id: &Value,
    new_content: &str,
    embedder: &dyn Embedder,
    metadata_patch: Option<&Map<String, Value>>,
) -> Result<UpdateOutcome> {
    let existing = retrieve_single(store, collection, point_id, true)?;

    let mut meta = payload_meta(&existing.payload);
    let content_hash = fingerprint::content_hash(new_content);
    meta.insert("hash_content".into(), json!(content_hash));
    meta.insert("content_hash".into(), json!(content_hash));

    let mut updated_fields = vec![
        "content".to_string(),
        "hash_content".to_string(),
        "updated_at".to_string(),
    ];
    if let Some(patch) = metadata_patch {
        for (key, value) in patch {
            meta.insert(key.clone(), value.clone());
            updated_fields.push(key.clone());
        }
    }
    refresh_meta(&mut meta);

    let vector = embedder.embed(new_content)?;

    let mut payload = existing.payload.clone();
    payload.insert("content".into(), json!(new_content));
    write_payload_meta(&mut payload, meta);

    store.upsert(
        collection,
        &[Point::new(existing.id.clone(), payload, Some(vector))],
    )?;

    Ok(UpdateOutcome {
        status: "success",
        document_id: existing.id_string(),
        message: "document content updated".into(),
        updated_fields,
    })
}

/// Update metadata fields only, preserving the existing vector. Fails with
/// `VectorMissing` when the store declines to return the vector; a zero
/// vector is never written in its place.
pub fn update_metadata(
    store: &dyn VectorStore,
    collection: &str,
    point_id: &Value,
    patch: &Map<String, Value>,
) -> Result<UpdateOutcome> {
    let existing = retrieve_single(store, collection, point_id, true)?;

    let vector = existing.vector.clone().ok_or_else(|| {
        PipelineError::VectorMissing(format!(
            "store returned no vector for {point_id}; refusing to overwrite it"
        ))
    })?;

    let mut meta = payload_meta(&existing.payload);
    for (key, value) in patch {
        meta.insert(key.clone(), value.clone());
    }
    refresh_meta(&mut meta);

    let mut payload = existing.payload.clone();
    write_payload_meta(&mut payload, meta);

    let mut point = Point::new(existing.id.clone(), payload, None);
    point.vector = Some(vector);
    store.upsert(collection, &[point])?;

    Ok(UpdateOutcome {
        status: "success",
        document_id: existing.id_string(),
        message: "document metadata updated".into(),
        updated_fields: patch.keys().cloned().collect(),
    })
}

/// Mark a stored record as deprecated.
pub fn deprecate(store: &dyn VectorStore, collection: &str, point_id: &Value) -> Result<UpdateOutcome> {
    let mut patch = Map::new();
    patch.insert("status".into(), json!(STATUS_DEPRECATED));
    update_metadata(store, collection, point_id, &patch)
}

/// All points sharing a logical `doc_id`, sorted lexicographically by
/// `(version, created_at)`. Deprecated versions are included by default.
pub fn get_version_history(
    store: &dyn VectorStore,
    collection: &str,
    doc_id: &str,
    category: Option<&str>,
    include_deprecated: bool,
) -> Result<Vec<Point>> {
    let status = if include_deprecated {
        None
    } else {
        Some(schema::STATUS_ACTIVE)
    };
    let mut points = query::lookup_by_doc_id(store, collection, doc_id, category, status)?;

    let sort_key = |point: &Point| -> (String, String) {
        let field = |name: &str| {
            payload_meta_field(&point.payload, name)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        (field("version"), field("created_at"))
    };
    points.sort_by_key(sort_key);
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollectionInfo, PayloadShape, ScoredPoint};
    use std::sync::Mutex;

    struct MiniStore {
        points: Mutex<Vec<Point>>,
    }

    impl MiniStore {
        fn with(points: Vec<Point>) -> MiniStore {
            MiniStore {
                points: Mutex::new(points),
            }
        }
        fn get(&self, id: &Value) -> Option<Point> {
            self.points
                .lock()
                .unwrap()
                .iter()
                .find(|p| &p.id == id)
                .cloned()
        }
    }

    impl VectorStore for MiniStore {
        fn scroll(
            &self,
            _c: &str,
            _f: Option<&Value>,
            _l: usize,
            _o: Option<&Value>,
            _p: bool,
            _v: bool,
        ) -> Result<(Vec<Point>, Option<Value>)> {
            Ok((self.points.lock().unwrap().clone(), None))
        }
        fn upsert(&self, _c: &str, incoming: &[Point]) -> Result<()> {
            let mut points = self.points.lock().unwrap();
            for point in incoming {
                points.retain(|p| p.id != point.id);
                points.push(point.clone());
            }
            Ok(())
        }
        fn delete(&self, _c: &str, ids: &[Value]) -> Result<()> {
            self.points.lock().unwrap().retain(|p| !ids.contains(&p.id));
            Ok(())
        }
        fn retrieve(&self, _c: &str, ids: &[Value], _p: bool, with_vectors: bool) -> Result<Vec<Point>> {
            Ok(self
                .points
                .lock()
                .unwrap()
                .iter()
                .filter(|p| ids.contains(&p.id))
                .cloned()
                .map(|mut p| {
                    if !with_vectors {
                        p.vector = None;
                    }
                    p
                })
                .collect())
        }
        fn get_collection(&self, _c: &str) -> Result<CollectionInfo> {
            Ok(CollectionInfo {
                points_count: self.points.lock().unwrap().len(),
                payload_schema: Map::new(),
            })
        }
        fn create_payload_index(&self, _c: &str, _f: &str, _s: &str) -> Result<()> {
            Ok(())
        }
        fn search(
            &self,
            _c: &str,
            _v: &[f32],
            _f: Option<&Value>,
            _k: usize,
            _p: bool,
        ) -> Result<Vec<ScoredPoint>> {
            Ok(vec![])
        }
    }

    struct FixedEmbedder;
    impl Embedder for FixedEmbedder {
        fn dim(&self) -> usize {
            3
        }
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.5, 0.5, 0.5])
        }
    }

    fn nested_point(id: &str, content: &str, vector: Option<Vec<f32>>) -> Point {
        let payload: Map<String, Value> = serde_json::from_value(json!({
            "content": content,
            "meta": {
                "doc_id": "d1",
                "category": "other",
                "status": "active",
                "hash_content": fingerprint::content_hash(content),
            }
        }))
        .unwrap();
        Point::new(json!(id), payload, vector)
    }

    #[test]
    fn update_content_rewrites_hash_and_vector_under_same_id() {
        let store = MiniStore::with(vec![nested_point("p1", "old text", Some(vec![0.0, 0.0, 0.0]))]);
        let outcome =
            update_content(&store, "c", &json!("p1"), "new text", &FixedEmbedder, None).unwrap();
        assert_eq!(outcome.document_id, "p1");

        let point = store.get(&json!("p1")).unwrap();
        assert_eq!(point.payload["content"], "new text");
        assert_eq!(
            point.payload["meta"]["hash_content"],
            json!(fingerprint::content_hash("new text"))
        );
        assert_eq!(point.vector.unwrap().as_plain().unwrap(), &[0.5, 0.5, 0.5]);
        assert_eq!(store.points.lock().unwrap().len(), 1);
    }

    #[test]
    fn update_metadata_without_vector_is_vector_missing() {
        let store = MiniStore::with(vec![nested_point("p1", "text", None)]);
        let mut patch = Map::new();
        patch.insert("status".into(), json!("draft"));
        let err = update_metadata(&store, "c", &json!("p1"), &patch).unwrap_err();
        assert_eq!(err.kind(), "VectorMissing");
        // and the stored point is untouched
        assert_eq!(store.get(&json!("p1")).unwrap().payload["meta"]["status"], "active");
    }

    #[test]
    fn update_metadata_on_missing_point_is_not_found() {
        let store = MiniStore::with(vec![]);
        let err = update_metadata(&store, "c", &json!("ghost"), &Map::new()).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn deprecate_preserves_flat_shape_and_vector() {
        let payload: Map<String, Value> = serde_json::from_value(json!({
            "content": "text",
            "doc_id": "d1",
            "status": "active",
            "hash_content": "abc",
        }))
        .unwrap();
        let store = MiniStore::with(vec![Point::new(json!("p1"), payload, Some(vec![1.0, 2.0, 3.0]))]);

        deprecate(&store, "c", &json!("p1")).unwrap();

        let point = store.get(&json!("p1")).unwrap();
        assert_eq!(crate::store::detect_shape(&point.payload), PayloadShape::Flat);
        assert_eq!(point.payload["status"], "deprecated");
        // hash fields survive the status flip
        assert_eq!(point.payload["hash_content"], "abc");
        assert_eq!(point.vector.unwrap().as_plain().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn metadata_hash_regeneration_matches_both_shapes() {
        // Same logical metadata stored nested and flat must regenerate the
        // same metadata_hash.
        let nested = MiniStore::with(vec![nested_point("p1", "text", Some(vec![0.0]))]);
        let flat_payload: Map<String, Value> = serde_json::from_value(json!({
            "content": "text",
            "doc_id": "d1",
            "category": "other",
            "status": "active",
            "hash_content": fingerprint::content_hash("text"),
        }))
        .unwrap();
        let flat = MiniStore::with(vec![Point::new(json!("p1"), flat_payload, Some(vec![0.0]))]);

        let mut patch = Map::new();
        patch.insert("repo".into(), json!("r2"));
        update_metadata(&nested, "c", &json!("p1"), &patch).unwrap();
        update_metadata(&flat, "c", &json!("p1"), &patch).unwrap();

        let nested_hash = nested.get(&json!("p1")).unwrap().payload["meta"]["metadata_hash"].clone();
        let flat_hash = flat.get(&json!("p1")).unwrap().payload["metadata_hash"].clone();
        assert_eq!(nested_hash, flat_hash);
    }
}
