use serde::Serialize;

use crate::chunker;
use crate::fingerprint::Fingerprint;
use crate::store::{payload_meta_field, Point};

// ---------------------------------------------------------------------------
// Four-level duplicate detection.
//
//   1 EXACT   same content_hash AND metadata_hash           → skip
//   2 UPDATE  same doc_id OR metadata_hash, different hash  → update
//   3 SIMILAR embeddings close above threshold              → warn
//   4 NEW     none of the above                              → store
//
// Levels are evaluated in order; the first match wins. Level 3 is reserved:
// the threshold and action are defined here, but classification currently
// falls through from level 2 to level 4 (conservative behaviour: a near-
// duplicate is stored rather than flagged).
// ---------------------------------------------------------------------------

pub const DUPLICATE_LEVEL_EXACT: u8 = 1;
pub const DUPLICATE_LEVEL_UPDATE: u8 = 2;
pub const DUPLICATE_LEVEL_SIMILAR: u8 = 3;
pub const DUPLICATE_LEVEL_NEW: u8 = 4;

/// Cosine threshold for the reserved level-3 classification.
pub const SEMANTIC_SIMILARITY_THRESHOLD: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageAction {
    /// Exact duplicate: return the existing ID, do not write.
    Skip,
    /// Evolution of a logically identified document: deprecate old, write new.
    Update,
    /// Probable near-duplicate: write with a warning metadata field.
    Warn,
    /// Genuinely new material.
    Store,
}

impl StorageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageAction::Skip => "skip",
            StorageAction::Update => "update",
            StorageAction::Warn => "warn",
            StorageAction::Store => "store",
        }
    }
}

fn meta_str<'a>(point: &'a Point, field: &str) -> Option<&'a str> {
    payload_meta_field(&point.payload, field).and_then(|v| v.as_str())
}

fn point_content_hash(point: &Point) -> Option<&str> {
    meta_str(point, "hash_content").or_else(|| meta_str(point, "content_hash"))
}

/// Classify a prospective write against the candidate set of existing
/// points. For chunk-level detection, `doc_id` carries the chunk_id and
/// `(parent_doc_id, chunk_index)` acts as a secondary identity key.
///
/// Returns the level, the matching point (levels 1 and 2), and a
/// human-readable reason.
pub fn check_duplicate_level<'a>(
    fingerprint: &Fingerprint,
    existing: &'a [Point],
    doc_id: Option<&str>,
    is_chunk: bool,
) -> (u8, Option<&'a Point>, String) {
    let entity = if is_chunk { "chunk" } else { "document" };

    if existing.is_empty() {
        return (DUPLICATE_LEVEL_NEW, None, "no existing documents found".into());
    }

    // Level 1: exact duplicate.
    for point in existing {
        let same_content = point_content_hash(point) == Some(fingerprint.content_hash.as_str());
        let same_metadata =
            meta_str(point, "metadata_hash") == Some(fingerprint.metadata_hash.as_str());
        if same_content && same_metadata {
            return (
                DUPLICATE_LEVEL_EXACT,
                Some(point),
                format!(
                    "exact duplicate {entity}: same content_hash ({}…) and metadata_hash",
                    &fingerprint.content_hash[..8.min(fingerprint.content_hash.len())]
                ),
            );
        }
    }

    // Level 2: content update of a logically identified record.
    for point in existing {
        let different_content =
            point_content_hash(point) != Some(fingerprint.content_hash.as_str());
        if !different_content {
            continue;
        }

        if is_chunk {
            if let Some(chunk_id) = doc_id {
                if meta_str(point, "chunk_id") == Some(chunk_id) {
                    return (
                        DUPLICATE_LEVEL_UPDATE,
                        Some(point),
                        format!("chunk update: same chunk_id ({chunk_id}) but different content_hash"),
                    );
                }
                // Secondary key: (parent_doc_id, chunk_index) identifies the
                // same slot even when the stored record lacks a chunk_id.
                let slot = payload_meta_field(&point.payload, "chunk_index")
                    .and_then(|v| v.as_u64())
                    .zip(meta_str(point, "parent_doc_id"));
                if let Some((index, parent)) = slot {
                    if chunker::chunk_id(parent, index as usize) == chunk_id {
                        return (
                            DUPLICATE_LEVEL_UPDATE,
                            Some(point),
                            format!(
                                "chunk update: same (parent_doc_id, chunk_index) ({parent}, {index}) but different content_hash"
                            ),
                        );
                    }
                }
            }
        }

        if let Some(doc_id) = doc_id {
            if meta_str(point, "doc_id") == Some(doc_id) {
                return (
                    DUPLICATE_LEVEL_UPDATE,
                    Some(point),
                    format!("content update: same doc_id ({doc_id}) but different content_hash"),
                );
            }
        }

        if meta_str(point, "metadata_hash") == Some(fingerprint.metadata_hash.as_str()) {
            return (
                DUPLICATE_LEVEL_UPDATE,
                Some(point),
                format!(
                    "content update: same metadata_hash ({}…) but different content_hash",
                    &fingerprint.metadata_hash[..8.min(fingerprint.metadata_hash.len())]
                ),
            );
        }
    }

    // Level 3 (reserved) falls through to level 4.
    (
        DUPLICATE_LEVEL_NEW,
        None,
        format!("new {entity}: different content_hash and/or metadata_hash"),
    )
}

/// Map a duplicate level to its storage action.
pub fn decide_storage_action(level: u8) -> StorageAction {
    match level {
        DUPLICATE_LEVEL_EXACT => StorageAction::Skip,
        DUPLICATE_LEVEL_UPDATE => StorageAction::Update,
        DUPLICATE_LEVEL_SIMILAR => StorageAction::Warn,
        _ => StorageAction::Store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn existing_point(id: &str, meta: Value) -> Point {
        let payload: Map<String, Value> =
            serde_json::from_value(json!({ "content": "x", "meta": meta })).unwrap();
        Point::new(json!(id), payload, None)
    }

    fn fp(content_hash: &str, metadata_hash: &str) -> Fingerprint {
        Fingerprint {
            content_hash: content_hash.into(),
            metadata_hash: metadata_hash.into(),
            composite_key: format!("{content_hash}:{metadata_hash}"),
        }
    }

    #[test]
    fn empty_candidate_set_is_new() {
        let (level, matching, _) = check_duplicate_level(&fp("c1", "m1"), &[], Some("d1"), false);
        assert_eq!(level, DUPLICATE_LEVEL_NEW);
        assert!(matching.is_none());
        assert_eq!(decide_storage_action(level), StorageAction::Store);
    }

    #[test]
    fn identical_hashes_are_exact_duplicates() {
        let existing = vec![existing_point(
            "p1",
            json!({ "doc_id": "d1", "hash_content": "c1", "metadata_hash": "m1" }),
        )];
        let (level, matching, reason) =
            check_duplicate_level(&fp("c1", "m1"), &existing, Some("d1"), false);
        assert_eq!(level, DUPLICATE_LEVEL_EXACT);
        assert_eq!(matching.unwrap().id_string(), "p1");
        assert!(reason.contains("exact duplicate"));
        assert_eq!(decide_storage_action(level), StorageAction::Skip);
    }

    #[test]
    fn legacy_content_hash_field_counts_for_level_one() {
        let existing = vec![existing_point(
            "p1",
            json!({ "doc_id": "d1", "content_hash": "c1", "metadata_hash": "m1" }),
        )];
        let (level, _, _) = check_duplicate_level(&fp("c1", "m1"), &existing, None, false);
        assert_eq!(level, DUPLICATE_LEVEL_EXACT);
    }

    #[test]
    fn same_doc_id_with_new_content_is_update() {
        let existing = vec![existing_point(
            "p1",
            json!({ "doc_id": "d1", "hash_content": "old", "metadata_hash": "m-old" }),
        )];
        let (level, matching, _) =
            check_duplicate_level(&fp("new", "m-new"), &existing, Some("d1"), false);
        assert_eq!(level, DUPLICATE_LEVEL_UPDATE);
        assert_eq!(matching.unwrap().id_string(), "p1");
        assert_eq!(decide_storage_action(level), StorageAction::Update);
    }

    #[test]
    fn same_metadata_hash_with_new_content_is_update() {
        let existing = vec![existing_point(
            "p1",
            json!({ "doc_id": "other", "hash_content": "old", "metadata_hash": "m1" }),
        )];
        let (level, _, _) = check_duplicate_level(&fp("new", "m1"), &existing, None, false);
        assert_eq!(level, DUPLICATE_LEVEL_UPDATE);
    }

    #[test]
    fn exact_match_wins_over_update_candidates() {
        // One exact twin and one same-doc_id revision: level 1 must win.
        let existing = vec![
            existing_point(
                "rev",
                json!({ "doc_id": "d1", "hash_content": "old", "metadata_hash": "m-old" }),
            ),
            existing_point(
                "twin",
                json!({ "doc_id": "d1", "hash_content": "c1", "metadata_hash": "m1" }),
            ),
        ];
        let (level, matching, _) =
            check_duplicate_level(&fp("c1", "m1"), &existing, Some("d1"), false);
        assert_eq!(level, DUPLICATE_LEVEL_EXACT);
        assert_eq!(matching.unwrap().id_string(), "twin");
    }

    #[test]
    fn chunk_identity_matches_by_chunk_id() {
        let existing = vec![existing_point(
            "p1",
            json!({ "chunk_id": "d1_chunk_0", "hash_content": "old", "metadata_hash": "m" }),
        )];
        let (level, _, reason) =
            check_duplicate_level(&fp("new", "m2"), &existing, Some("d1_chunk_0"), true);
        assert_eq!(level, DUPLICATE_LEVEL_UPDATE);
        assert!(reason.contains("chunk update"));
    }

    #[test]
    fn chunk_identity_falls_back_to_parent_and_index() {
        // Stored chunk has no chunk_id, only the (parent, index) pair.
        let existing = vec![existing_point(
            "p1",
            json!({ "parent_doc_id": "d1", "chunk_index": 2, "hash_content": "old", "metadata_hash": "m" }),
        )];
        let (level, _, reason) =
            check_duplicate_level(&fp("new", "m2"), &existing, Some("d1_chunk_2"), true);
        assert_eq!(level, DUPLICATE_LEVEL_UPDATE);
        assert!(reason.contains("parent_doc_id"));
    }

    #[test]
    fn unrelated_existing_points_classify_as_new() {
        let existing = vec![existing_point(
            "p1",
            json!({ "doc_id": "other", "hash_content": "x", "metadata_hash": "y" }),
        )];
        let (level, matching, _) =
            check_duplicate_level(&fp("c1", "m1"), &existing, Some("d1"), false);
        assert_eq!(level, DUPLICATE_LEVEL_NEW);
        assert!(matching.is_none());
    }
}
