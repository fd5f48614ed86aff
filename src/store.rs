use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Vector-store adapter.
//
// The external store is a collection of points, each holding an opaque ID,
// a vector, and a JSON payload. The adapter hides the wire protocol behind
// the `VectorStore` trait; every bulk operation in the pipeline is built on
// the scroll primitive below rather than on any convenience method.
//
// Scroll contract: pages of at most SCROLL_BATCH_SIZE points, threading the
// store's opaque `next_offset` cursor until exhausted. No point is yielded
// twice within one scroll; order is unspecified; a concurrent mutation may
// cause a point to be skipped or repeated across independent scroll
// sessions. Callers compensate (deletes absorb missing IDs as no-ops,
// upserts are idempotent on stable IDs).
// ---------------------------------------------------------------------------

/// Fixed page size for scroll-based iteration and batched mutations.
pub const SCROLL_BATCH_SIZE: usize = 100;

/// Payload fields that must carry a keyword index for filtered operations.
pub const REQUIRED_INDEX_FIELDS: [&str; 9] = [
    "meta.doc_id",
    "meta.category",
    "meta.status",
    "meta.repo",
    "meta.version",
    "meta.file_path",
    "meta.hash_content",
    "meta.content_hash",
    "meta.metadata_hash",
];

/// A point's vector: either a bare list of floats or a named-vector map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointVector {
    Plain(Vec<f32>),
    Named(BTreeMap<String, Vec<f32>>),
}

impl PointVector {
    /// The effective vector: the plain list, or the `default` entry (first
    /// entry otherwise) of a named-vector map.
    pub fn as_plain(&self) -> Option<&[f32]> {
        match self {
            PointVector::Plain(v) => Some(v),
            PointVector::Named(map) => map
                .get("default")
                .or_else(|| map.values().next())
                .map(Vec::as_slice),
        }
    }
}

/// The storage unit of the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: Value,
    /// The store sends `"payload": null` when payloads were not requested.
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<PointVector>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Point {
    pub fn new(id: impl Into<Value>, payload: Map<String, Value>, vector: Option<Vec<f32>>) -> Point {
        Point {
            id: id.into(),
            payload,
            vector: vector.map(PointVector::Plain),
        }
    }

    pub fn id_string(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A search hit: the point plus its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPoint {
    pub point: Point,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionInfo {
    pub points_count: usize,
    pub payload_schema: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Payload shape handling.
//
// Two shapes coexist in the wild: nested (`payload.meta.*`) and flat
// (metadata fields at the payload top level). The shape is detected per
// point and writes preserve whichever shape the store returned, never
// normalized silently.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Nested,
    Flat,
}

/// Fields of a flat payload that are not metadata.
const FLAT_NON_META_FIELDS: [&str; 2] = ["content", "id"];

pub fn detect_shape(payload: &Map<String, Value>) -> PayloadShape {
    match payload.get("meta") {
        Some(Value::Object(_)) => PayloadShape::Nested,
        _ => PayloadShape::Flat,
    }
}

/// The point's content string, shape-independent.
pub fn payload_content(payload: &Map<String, Value>) -> &str {
    payload.get("content").and_then(Value::as_str).unwrap_or("")
}

/// A copy of the point's metadata record, shape-independent. For flat
/// payloads the non-metadata fields (`content`, `id`) are stripped.
pub fn payload_meta(payload: &Map<String, Value>) -> Map<String, Value> {
    match payload.get("meta") {
        Some(Value::Object(meta)) => meta.clone(),
        _ => {
            let mut meta = payload.clone();
            for field in FLAT_NON_META_FIELDS {
                meta.remove(field);
            }
            meta
        }
    }
}

/// Write a metadata record back into a payload, preserving its shape.
pub fn write_payload_meta(payload: &mut Map<String, Value>, meta: Map<String, Value>) {
    match detect_shape(payload) {
        PayloadShape::Nested => {
            payload.insert("meta".into(), Value::Object(meta));
        }
        PayloadShape::Flat => {
            for (key, value) in meta {
                payload.insert(key, value);
            }
        }
    }
}

/// Read a single metadata field from a payload of either shape.
pub fn payload_meta_field<'a>(payload: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    match payload.get("meta") {
        Some(Value::Object(meta)) => meta.get(field),
        _ => payload.get(field),
    }
}

// ---------------------------------------------------------------------------
// The store interface.
// ---------------------------------------------------------------------------

pub trait VectorStore: Send + Sync {
    /// One page of a filtered scroll. Returns the page and the opaque cursor
    /// for the next page (`None` when exhausted).
    fn scroll(
        &self,
        collection: &str,
        filter: Option<&Value>,
        limit: usize,
        offset: Option<&Value>,
        with_payload: bool,
        with_vectors: bool,
    ) -> Result<(Vec<Point>, Option<Value>)>;

    fn upsert(&self, collection: &str, points: &[Point]) -> Result<()>;

    fn delete(&self, collection: &str, ids: &[Value]) -> Result<()>;

    fn retrieve(
        &self,
        collection: &str,
        ids: &[Value],
        with_payload: bool,
        with_vectors: bool,
    ) -> Result<Vec<Point>>;

    /// Merge payload fields into the given points. The default falls back to
    /// retrieve + merge + upsert for stores without a native operation.
    fn set_payload(&self, collection: &str, ids: &[Value], payload: &Map<String, Value>) -> Result<()> {
        let points = self.retrieve(collection, ids, true, true)?;
        let mut updated = Vec::with_capacity(points.len());
        for mut point in points {
            for (key, value) in payload {
                point.payload.insert(key.clone(), value.clone());
            }
            updated.push(point);
        }
        if updated.is_empty() {
            return Ok(());
        }
        self.upsert(collection, &updated)
    }

    fn get_collection(&self, collection: &str) -> Result<CollectionInfo>;

    fn create_payload_index(&self, collection: &str, field: &str, schema_type: &str) -> Result<()>;

    /// Nearest-neighbour search under an optional filter.
    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Value>,
        top_k: usize,
        with_payload: bool,
    ) -> Result<Vec<ScoredPoint>>;

    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.get_collection(collection)?.points_count)
    }
}

/// Drive a full scroll, handing each page to `on_page`. The foundation of
/// every bulk operation.
pub fn scroll_pages<F>(
    store: &dyn VectorStore,
    collection: &str,
    filter: Option<&Value>,
    with_payload: bool,
    with_vectors: bool,
    mut on_page: F,
) -> Result<()>
where
    F: FnMut(Vec<Point>) -> Result<()>,
{
    let mut offset: Option<Value> = None;
    loop {
        let (points, next_offset) = store.scroll(
            collection,
            filter,
            SCROLL_BATCH_SIZE,
            offset.as_ref(),
            with_payload,
            with_vectors,
        )?;
        if points.is_empty() {
            return Ok(());
        }
        on_page(points)?;
        match next_offset {
            Some(cursor) => offset = Some(cursor),
            None => return Ok(()),
        }
    }
}

/// Collect a full scroll into memory.
pub fn scroll_all(
    store: &dyn VectorStore,
    collection: &str,
    filter: Option<&Value>,
    with_payload: bool,
    with_vectors: bool,
) -> Result<Vec<Point>> {
    let mut out = Vec::new();
    scroll_pages(store, collection, filter, with_payload, with_vectors, |page| {
        out.extend(page);
        Ok(())
    })?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Payload-index assertion (startup).
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
pub struct IndexReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub errors: Vec<String>,
}

/// Assert that every required payload field has a keyword index on the
/// collection. Missing indexes are created; existing ones are left alone.
/// Creation failures are reported (and logged) but not fatal; operations
/// that need the index will surface `IndexRequired` from the store.
pub fn ensure_payload_indexes(store: &dyn VectorStore, collection: &str) -> IndexReport {
    let mut report = IndexReport::default();

    let schema = match store.get_collection(collection) {
        Ok(info) => info.payload_schema,
        Err(e) => {
            crate::debug_log!("[vectorloom] failed to read collection {collection}: {e}");
            report.errors.push(e.to_string());
            return report;
        }
    };

    for field in REQUIRED_INDEX_FIELDS {
        if schema.contains_key(field) {
            report.existing.push(field.to_string());
            continue;
        }
        match store.create_payload_index(collection, field, "keyword") {
            Ok(()) => report.created.push(field.to_string()),
            Err(e) => {
                crate::debug_log!("[vectorloom] index creation failed for {field}: {e}");
                report.errors.push(format!("{field}: {e}"));
            }
        }
    }

    report
}

// ---------------------------------------------------------------------------
// HTTP adapter for the external store's REST API.
// ---------------------------------------------------------------------------

pub struct HttpStore {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl HttpStore {
    pub fn new(url: &str, api_key: &str) -> HttpStore {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();
        HttpStore {
            agent,
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn classify_status(code: u16, body: String) -> PipelineError {
        if body.contains("Index required") || body.contains("index required") {
            PipelineError::IndexRequired(body)
        } else if code == 404 {
            PipelineError::NotFound(body)
        } else {
            PipelineError::StoreUnavailable(format!("store returned {code}: {body}"))
        }
    }

    fn dispatch(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .agent
            .request(method, &url)
            .set("api-key", &self.api_key);

        let response = match body {
            Some(payload) => request.send_json(payload.clone()),
            None => request.call(),
        };

        match response {
            Ok(resp) => resp
                .into_json::<Value>()
                .map_err(|e| PipelineError::StoreUnavailable(format!("malformed store reply: {e}"))),
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                Err(Self::classify_status(code, text))
            }
            Err(ureq::Error::Transport(t)) => Err(PipelineError::StoreUnavailable(t.to_string())),
        }
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.dispatch("GET", path, None)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.dispatch("POST", path, Some(&body))
    }

    fn put(&self, path: &str, body: Value) -> Result<Value> {
        self.dispatch("PUT", path, Some(&body))
    }

    fn parse_points(raw: &Value) -> Result<Vec<Point>> {
        serde_json::from_value(raw.clone())
            .map_err(|e| PipelineError::StoreUnavailable(format!("malformed point list: {e}")))
    }
}

impl VectorStore for HttpStore {
    fn scroll(
        &self,
        collection: &str,
        filter: Option<&Value>,
        limit: usize,
        offset: Option<&Value>,
        with_payload: bool,
        with_vectors: bool,
    ) -> Result<(Vec<Point>, Option<Value>)> {
        let mut body = json!({
            "limit": limit,
            "with_payload": with_payload,
            "with_vector": with_vectors,
        });
        if let Some(f) = filter {
            body["filter"] = f.clone();
        }
        if let Some(cursor) = offset {
            body["offset"] = cursor.clone();
        }

        let reply = self.post(&format!("/collections/{collection}/points/scroll"), body)?;
        let points = Self::parse_points(&reply["result"]["points"])?;
        let next_offset = match &reply["result"]["next_page_offset"] {
            Value::Null => None,
            cursor => Some(cursor.clone()),
        };
        Ok((points, next_offset))
    }

    fn upsert(&self, collection: &str, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = json!({ "points": points });
        self.put(&format!("/collections/{collection}/points?wait=true"), body)?;
        Ok(())
    }

    fn delete(&self, collection: &str, ids: &[Value]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "points": ids });
        self.post(
            &format!("/collections/{collection}/points/delete?wait=true"),
            body,
        )?;
        Ok(())
    }

    fn retrieve(
        &self,
        collection: &str,
        ids: &[Value],
        with_payload: bool,
        with_vectors: bool,
    ) -> Result<Vec<Point>> {
        let body = json!({
            "ids": ids,
            "with_payload": with_payload,
            "with_vector": with_vectors,
        });
        let reply = self.post(&format!("/collections/{collection}/points"), body)?;
        Self::parse_points(&reply["result"])
    }

    fn set_payload(&self, collection: &str, ids: &[Value], payload: &Map<String, Value>) -> Result<()> {
        let body = json!({ "payload": payload, "points": ids });
        self.post(
            &format!("/collections/{collection}/points/payload?wait=true"),
            body,
        )?;
        Ok(())
    }

    fn get_collection(&self, collection: &str) -> Result<CollectionInfo> {
        let reply = self.get(&format!("/collections/{collection}"))?;
        let result = &reply["result"];
        Ok(CollectionInfo {
            points_count: result["points_count"].as_u64().unwrap_or(0) as usize,
            payload_schema: result["payload_schema"]
                .as_object()
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn create_payload_index(&self, collection: &str, field: &str, schema_type: &str) -> Result<()> {
        let body = json!({ "field_name": field, "field_schema": schema_type });
        self.put(&format!("/collections/{collection}/index?wait=true"), body)?;
        Ok(())
    }

    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Value>,
        top_k: usize,
        with_payload: bool,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": with_payload,
        });
        if let Some(f) = filter {
            body["filter"] = f.clone();
        }

        let reply = self.post(&format!("/collections/{collection}/points/search"), body)?;
        let hits = reply["result"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let score = hit["score"].as_f64().unwrap_or(0.0) as f32;
            let point: Point = serde_json::from_value(hit)
                .map_err(|e| PipelineError::StoreUnavailable(format!("malformed search hit: {e}")))?;
            out.push(ScoredPoint { point, score });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_detection() {
        let nested: Map<String, Value> =
            serde_json::from_value(json!({"content": "x", "meta": {"doc_id": "d1"}})).unwrap();
        assert_eq!(detect_shape(&nested), PayloadShape::Nested);

        let flat: Map<String, Value> =
            serde_json::from_value(json!({"content": "x", "doc_id": "d1"})).unwrap();
        assert_eq!(detect_shape(&flat), PayloadShape::Flat);
    }

    #[test]
    fn meta_access_is_shape_independent() {
        let nested: Map<String, Value> =
            serde_json::from_value(json!({"content": "x", "meta": {"doc_id": "d1", "status": "active"}}))
                .unwrap();
        let flat: Map<String, Value> =
            serde_json::from_value(json!({"content": "x", "id": "p1", "doc_id": "d1", "status": "active"}))
                .unwrap();

        assert_eq!(payload_meta(&nested)["doc_id"], "d1");
        let flat_meta = payload_meta(&flat);
        assert_eq!(flat_meta["doc_id"], "d1");
        // non-metadata fields stripped from the flat view
        assert!(!flat_meta.contains_key("content"));
        assert!(!flat_meta.contains_key("id"));

        assert_eq!(payload_meta_field(&nested, "status").unwrap(), "active");
        assert_eq!(payload_meta_field(&flat, "status").unwrap(), "active");
    }

    #[test]
    fn write_meta_preserves_shape() {
        let mut nested: Map<String, Value> =
            serde_json::from_value(json!({"content": "x", "meta": {"doc_id": "d1"}})).unwrap();
        let mut meta = payload_meta(&nested);
        meta.insert("status".into(), json!("deprecated"));
        write_payload_meta(&mut nested, meta);
        assert_eq!(detect_shape(&nested), PayloadShape::Nested);
        assert_eq!(nested["meta"]["status"], "deprecated");

        let mut flat: Map<String, Value> =
            serde_json::from_value(json!({"content": "x", "doc_id": "d1"})).unwrap();
        let mut meta = payload_meta(&flat);
        meta.insert("status".into(), json!("deprecated"));
        write_payload_meta(&mut flat, meta);
        assert_eq!(detect_shape(&flat), PayloadShape::Flat);
        assert_eq!(flat["status"], "deprecated");
        assert_eq!(flat["content"], "x");
    }

    #[test]
    fn named_vector_resolves_default_entry() {
        let named: PointVector =
            serde_json::from_value(json!({"default": [0.5, 0.25], "sparse": [1.0]})).unwrap();
        assert_eq!(named.as_plain().unwrap(), &[0.5, 0.25]);

        let plain: PointVector = serde_json::from_value(json!([0.1, 0.2])).unwrap();
        assert_eq!(plain.as_plain().unwrap(), &[0.1, 0.2]);
    }

    /// Minimal paging store: serves a fixed set of points in scroll pages.
    struct PagedStore {
        points: Vec<Point>,
    }

    impl VectorStore for PagedStore {
        fn scroll(
            &self,
            _collection: &str,
            _filter: Option<&Value>,
            limit: usize,
            offset: Option<&Value>,
            _with_payload: bool,
            _with_vectors: bool,
        ) -> Result<(Vec<Point>, Option<Value>)> {
            let start = offset.and_then(Value::as_u64).unwrap_or(0) as usize;
            let end = (start + limit).min(self.points.len());
            let page = self.points[start..end].to_vec();
            let next = if end < self.points.len() {
                Some(json!(end))
            } else {
                None
            };
            Ok((page, next))
        }

        fn upsert(&self, _c: &str, _p: &[Point]) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _c: &str, _ids: &[Value]) -> Result<()> {
            Ok(())
        }
        fn retrieve(&self, _c: &str, _ids: &[Value], _p: bool, _v: bool) -> Result<Vec<Point>> {
            Ok(vec![])
        }
        fn get_collection(&self, _c: &str) -> Result<CollectionInfo> {
            Ok(CollectionInfo::default())
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

    #[test]
    fn scroll_pages_threads_cursor_until_exhausted() {
        let points: Vec<Point> = (0..250)
            .map(|i| Point::new(json!(i), Map::new(), None))
            .collect();
        let store = PagedStore { points };

        let mut pages = Vec::new();
        scroll_pages(&store, "c", None, false, false, |page| {
            pages.push(page.len());
            Ok(())
        })
        .unwrap();
        assert_eq!(pages, vec![100, 100, 50]);

        let all = scroll_all(&store, "c", None, false, false).unwrap();
        assert_eq!(all.len(), 250);
        // no point yielded twice
        let ids: std::collections::HashSet<String> =
            all.iter().map(Point::id_string).collect();
        assert_eq!(ids.len(), 250);
    }
}
