use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::schema::VOLATILE_METADATA_FIELDS;

// ---------------------------------------------------------------------------
// Content fingerprinting: the identity layer of the whole pipeline.
//
// Every content hash in the system (ingest, dedup, chunking, verification,
// audit) goes through `normalize_content` first, so two renditions of the
// same text that differ only in line endings, trailing whitespace, case, or
// leftover placeholder markers collapse to the same SHA-256 digest.
//
// The metadata hash is computed over a canonical JSON encoding with keys
// sorted recursively and the volatile fields (created_at / updated_at /
// status / version) excluded, so re-hashing a stored record reproduces the
// stored value regardless of map iteration order.
// ---------------------------------------------------------------------------

/// Placeholder markers stripped during normalization. Case-insensitive.
const NORMALIZE_PLACEHOLDER_PATTERNS: [&str; 4] = [
    r"(?i)\[Full content from file\.\.\.\]",
    r"(?i)\[\.\.\.\]",
    r"(?i)\[TODO:.*?\]",
    r"(?i)\[TBD:.*?\]",
];

fn normalize_placeholder_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        NORMALIZE_PLACEHOLDER_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Normalize content for consistent hashing. Idempotent.
///
/// Steps, in order:
/// 1. Strip trailing whitespace from the whole string (not per line).
/// 2. Normalize `\r\n` then bare `\r` to `\n`.
/// 3. Remove placeholder markers (case-insensitive).
/// 4. Lowercase.
pub fn normalize_content(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }

    let mut normalized = content.trim_end().to_string();
    normalized = normalized.replace("\r\n", "\n").replace('\r', "\n");

    for re in normalize_placeholder_regexes() {
        normalized = re.replace_all(&normalized, "").into_owned();
    }

    // Placeholder removal can expose fresh trailing whitespace; strip it
    // again so normalization is a fixed point.
    normalized.trim_end().to_lowercase()
}

/// Hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of the normalized content. Empty content hashes to the
/// SHA-256 of the empty string.
pub fn content_hash(content: &str) -> String {
    sha256_hex(normalize_content(content).as_bytes())
}

/// Canonical JSON encoding: object keys sorted lexicographically at every
/// nesting level, no insignificant whitespace. Deterministic regardless of
/// the underlying map's iteration order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let key = serde_json::to_string(k).unwrap_or_default();
                    format!("{}:{}", key, canonical_json(&map[k.as_str()]))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        scalar => serde_json::to_string(scalar).unwrap_or_default(),
    }
}

/// Hex SHA-256 of the canonical JSON of `metadata` with the volatile fields
/// and any previously computed `metadata_hash` excluded. The exclusions are
/// identical for nested and flat payload shapes; flat-shape callers strip
/// the non-metadata `content` / `id` fields before calling.
pub fn metadata_hash(metadata: &Map<String, Value>) -> String {
    let mut stable = Map::new();
    for (key, value) in metadata {
        if VOLATILE_METADATA_FIELDS.contains(&key.as_str()) || key == "metadata_hash" {
            continue;
        }
        stable.insert(key.clone(), value.clone());
    }
    sha256_hex(canonical_json(&Value::Object(stable)).as_bytes())
}

/// The (content_hash, metadata_hash, composite_key) identity triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub metadata_hash: String,
    pub composite_key: String,
}

impl Fingerprint {
    /// Derive the fingerprint of a (content, metadata) pair. Never mutates
    /// its inputs.
    pub fn generate(content: &str, metadata: &Map<String, Value>) -> Fingerprint {
        let content_hash = content_hash(content);
        let metadata_hash = metadata_hash(metadata);
        let composite_key = format!("{content_hash}:{metadata_hash}");
        Fingerprint {
            content_hash,
            metadata_hash,
            composite_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalization_is_idempotent() {
        let raw = "Hello World \r\nSecond [TODO: fill in] line\r trailing   ";
        let once = normalize_content(raw);
        let twice = normalize_content(&once);
        assert_eq!(once, twice);
        assert!(!once.contains('\r'));
        assert!(!once.to_lowercase().contains("todo"));

        // A placeholder at the end of the string exposes trailing
        // whitespace when removed; normalization must still be a fixed
        // point there.
        let tail = "abc [TODO: finish this]";
        assert_eq!(normalize_content(tail), normalize_content(&normalize_content(tail)));
        assert_eq!(normalize_content(tail), "abc");
    }

    #[test]
    fn hash_equals_hash_of_normalized() {
        let raw = "Mixed CASE\r\nContent  ";
        assert_eq!(content_hash(raw), content_hash(&normalize_content(raw)));
    }

    #[test]
    fn empty_content_has_well_defined_hash() {
        // SHA-256 of the empty string.
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        // All-whitespace content normalizes to empty.
        assert_eq!(content_hash("   \n  "), content_hash(""));
    }

    #[test]
    fn placeholder_markers_are_stripped_case_insensitively() {
        let a = normalize_content("before [Full content from file...] after");
        let b = normalize_content("before [FULL CONTENT FROM FILE...] after");
        assert_eq!(a, b);
        assert!(!a.contains("full content"));
    }

    #[test]
    fn metadata_hash_ignores_key_order() {
        let a: Map<String, Value> = serde_json::from_value(json!({
            "doc_id": "d1",
            "category": "user_rule",
            "tags": ["x", "y"],
            "nested": {"b": 2, "a": 1}
        }))
        .unwrap();
        let b: Map<String, Value> = serde_json::from_value(json!({
            "nested": {"a": 1, "b": 2},
            "tags": ["x", "y"],
            "category": "user_rule",
            "doc_id": "d1"
        }))
        .unwrap();
        assert_eq!(metadata_hash(&a), metadata_hash(&b));
    }

    #[test]
    fn metadata_hash_excludes_volatile_fields_and_itself() {
        let base: Map<String, Value> = serde_json::from_value(json!({
            "doc_id": "d1",
            "category": "user_rule"
        }))
        .unwrap();
        let mut noisy = base.clone();
        noisy.insert("created_at".into(), json!("2025-01-01T00:00:00Z"));
        noisy.insert("updated_at".into(), json!("2025-06-01T00:00:00Z"));
        noisy.insert("status".into(), json!("deprecated"));
        noisy.insert("version".into(), json!("v9"));
        noisy.insert("metadata_hash".into(), json!("deadbeef"));
        assert_eq!(metadata_hash(&base), metadata_hash(&noisy));
    }

    #[test]
    fn composite_key_joins_both_hashes() {
        let meta: Map<String, Value> =
            serde_json::from_value(json!({"doc_id": "d1", "category": "other"})).unwrap();
        let fp = Fingerprint::generate("hello", &meta);
        assert_eq!(
            fp.composite_key,
            format!("{}:{}", fp.content_hash, fp.metadata_hash)
        );
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let v = json!({"z": {"b": 1, "a": [true, null]}, "a": 2});
        assert_eq!(canonical_json(&v), r#"{"a":2,"z":{"a":[true,null],"b":1}}"#);
    }
}
