use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::filter::FilterNode;
use crate::store::{payload_meta_field, scroll_all, Point, ScoredPoint, VectorStore};

// ---------------------------------------------------------------------------
// Query service: exact-match lookups over indexed payload fields, filtered
// semantic search, and administrative aggregation.
// ---------------------------------------------------------------------------

pub const DEFAULT_TOP_K: usize = 10;

fn lookup(
    store: &dyn VectorStore,
    collection: &str,
    conditions: Vec<FilterNode>,
) -> Result<Vec<Point>> {
    let filter = FilterNode::and(conditions).to_store_filter()?;
    scroll_all(store, collection, Some(&filter), true, false)
}

/// All points with the given `doc_id`, optionally narrowed by category and
/// status. Callers that want "the current record" pass `Some("active")`.
pub fn lookup_by_doc_id(
    store: &dyn VectorStore,
    collection: &str,
    doc_id: &str,
    category: Option<&str>,
    status: Option<&str>,
) -> Result<Vec<Point>> {
    let mut conditions = vec![FilterNode::eq("meta.doc_id", doc_id)];
    if let Some(category) = category {
        conditions.push(FilterNode::eq("meta.category", category));
    }
    if let Some(status) = status {
        conditions.push(FilterNode::eq("meta.status", status));
    }
    lookup(store, collection, conditions)
}

/// Points whose content hash matches. Queries `meta.hash_content` first and
/// falls back to the legacy `meta.content_hash` field when nothing matches.
pub fn lookup_by_content_hash(
    store: &dyn VectorStore,
    collection: &str,
    content_hash: &str,
    status: Option<&str>,
) -> Result<Vec<Point>> {
    for field in ["meta.hash_content", "meta.content_hash"] {
        let mut conditions = vec![FilterNode::eq(field, content_hash)];
        if let Some(status) = status {
            conditions.push(FilterNode::eq("meta.status", status));
        }
        let points = lookup(store, collection, conditions)?;
        if !points.is_empty() {
            return Ok(points);
        }
    }
    Ok(Vec::new())
}

/// Points whose `meta.file_path` matches exactly.
pub fn lookup_by_file_path(
    store: &dyn VectorStore,
    collection: &str,
    file_path: &str,
    status: Option<&str>,
) -> Result<Vec<Point>> {
    let mut conditions = vec![FilterNode::eq("meta.file_path", file_path)];
    if let Some(status) = status {
        conditions.push(FilterNode::eq("meta.status", status));
    }
    lookup(store, collection, conditions)
}

/// Semantic search: embed the query, ask the store for the `top_k` nearest
/// points under the (optional) filter, return them with similarity scores.
pub fn search_with_filters(
    store: &dyn VectorStore,
    collection: &str,
    query_text: &str,
    embedder: &dyn Embedder,
    filters: Option<&FilterNode>,
    top_k: usize,
) -> Result<Vec<ScoredPoint>> {
    let query_vector = embedder.embed_query(query_text)?;
    let store_filter = match filters {
        Some(node) => Some(node.to_store_filter()?),
        None => None,
    };
    store.search(
        collection,
        &query_vector,
        store_filter.as_ref(),
        top_k,
        true,
    )
}

/// All chunk points of a parent document, sorted by `chunk_index`.
pub fn lookup_chunks_by_parent(
    store: &dyn VectorStore,
    collection: &str,
    parent_doc_id: &str,
    status: Option<&str>,
) -> Result<Vec<Point>> {
    let mut conditions = vec![FilterNode::eq("meta.parent_doc_id", parent_doc_id)];
    if let Some(status) = status {
        conditions.push(FilterNode::eq("meta.status", status));
    }
    let mut points = lookup(store, collection, conditions)?;
    points.sort_by_key(|point| {
        payload_meta_field(&point.payload, "chunk_index")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    });
    Ok(points)
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldStats {
    pub unique_count: usize,
    /// (value, count) pairs, most frequent first.
    pub values: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataStats {
    pub total_documents: usize,
    pub by_field: BTreeMap<String, BTreeMap<String, usize>>,
    pub field_values: BTreeMap<String, FieldStats>,
}

/// Default aggregation dimensions.
pub const DEFAULT_GROUP_BY: [&str; 3] = ["category", "status", "source"];

fn field_value_label(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "unknown".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Scroll the matching points and count value occurrences per `group_by`
/// field. O(N) over the filtered collection; administrative use only.
pub fn aggregate(
    store: &dyn VectorStore,
    collection: &str,
    filters: Option<&FilterNode>,
    group_by: Option<&[String]>,
) -> Result<MetadataStats> {
    let store_filter = match filters {
        Some(node) => Some(node.to_store_filter()?),
        None => None,
    };
    let points = scroll_all(store, collection, store_filter.as_ref(), true, false)?;

    let default_fields: Vec<String> = DEFAULT_GROUP_BY.iter().map(|s| s.to_string()).collect();
    let fields: &[String] = group_by.unwrap_or(&default_fields);

    let mut by_field: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for field in fields {
        let counts = by_field.entry(field.clone()).or_default();
        for point in &points {
            let label = field_value_label(payload_meta_field(&point.payload, field));
            *counts.entry(label).or_insert(0) += 1;
        }
    }

    let field_values = by_field
        .iter()
        .map(|(field, counts)| {
            let mut values: Vec<(String, usize)> =
                counts.iter().map(|(v, c)| (v.clone(), *c)).collect();
            values.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            (
                field.clone(),
                FieldStats {
                    unique_count: counts.len(),
                    values,
                },
            )
        })
        .collect();

    Ok(MetadataStats {
        total_documents: points.len(),
        by_field,
        field_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollectionInfo;
    use serde_json::{json, Map};

    struct FixedStore {
        points: Vec<Point>,
    }

    impl VectorStore for FixedStore {
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
            let next = (end < self.points.len()).then(|| json!(end));
            Ok((self.points[start..end].to_vec(), next))
        }
        fn upsert(&self, _c: &str, _p: &[Point]) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _c: &str, _i: &[Value]) -> Result<()> {
            Ok(())
        }
        fn retrieve(&self, _c: &str, _i: &[Value], _p: bool, _v: bool) -> Result<Vec<Point>> {
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

    fn point(category: &str, status: &str) -> Point {
        let payload: Map<String, Value> = serde_json::from_value(json!({
            "content": "x",
            "meta": { "category": category, "status": status }
        }))
        .unwrap();
        Point::new(json!("id"), payload, None)
    }

    #[test]
    fn aggregate_counts_values_per_field() {
        let store = FixedStore {
            points: vec![
                point("user_rule", "active"),
                point("user_rule", "deprecated"),
                point("design_doc", "active"),
            ],
        };

        let stats = aggregate(&store, "c", None, None).unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.by_field["category"]["user_rule"], 2);
        assert_eq!(stats.by_field["category"]["design_doc"], 1);
        assert_eq!(stats.by_field["status"]["active"], 2);
        // `source` absent on all points → counted as unknown.
        assert_eq!(stats.by_field["source"]["unknown"], 3);
        assert_eq!(stats.field_values["category"].unique_count, 2);
        // most frequent first
        assert_eq!(stats.field_values["category"].values[0].0, "user_rule");
    }
}
