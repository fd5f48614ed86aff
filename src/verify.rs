use ignore::WalkBuilder;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::Result;
use crate::fingerprint;
use crate::schema::{self, FILE_BACKED_CATEGORIES, PLACEHOLDER_PATTERNS, REQUIRED_METADATA_FIELDS};
use crate::store::{payload_content, payload_meta, scroll_all, Point, VectorStore};

// ---------------------------------------------------------------------------
// Verifier & auditor.
//
// Per-document quality checks (placeholders, length, required metadata,
// hash integrity) plus a storage-integrity audit that walks a source
// directory and classifies every file as matched, mismatched, or missing
// from the store.
// ---------------------------------------------------------------------------

/// Minimum content length for a document to count as substantive.
pub const MIN_CONTENT_LENGTH: usize = 100;

fn placeholder_regexes() -> &'static Vec<(String, Regex)> {
    static REGEXES: OnceLock<Vec<(String, Regex)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        PLACEHOLDER_PATTERNS
            .iter()
            .filter_map(|pattern| {
                let label = pattern
                    .replace("(?i)", "")
                    .replace('\\', "")
                    .replace(['[', ']'], "")
                    .replace(".*?", "");
                Regex::new(pattern).ok().map(|re| (label, re))
            })
            .collect()
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaceholderReport {
    pub has_placeholder: bool,
    pub placeholder_count: usize,
    pub placeholder_types: Vec<String>,
    pub placeholder_positions: Vec<(usize, usize)>,
}

/// Detect placeholder markers in content.
pub fn detect_placeholders(content: &str) -> PlaceholderReport {
    if content.is_empty() {
        return PlaceholderReport::default();
    }

    let mut report = PlaceholderReport::default();
    for (label, re) in placeholder_regexes() {
        let mut hit = false;
        for m in re.find_iter(content) {
            report.placeholder_positions.push((m.start(), m.end()));
            hit = true;
        }
        if hit && !report.placeholder_types.contains(label) {
            report.placeholder_types.push(label.clone());
        }
    }
    report.placeholder_count = report.placeholder_positions.len();
    report.has_placeholder = report.placeholder_count > 0;
    report
}

#[derive(Debug, Clone, Serialize)]
pub struct HashVerification {
    pub hash_valid: bool,
    pub computed_hash: Option<String>,
    pub stored_hash: Option<String>,
}

/// Recompute the content hash (shared normalization) and compare to the
/// stored one.
pub fn verify_hash_integrity(content: &str, stored_hash: Option<&str>) -> HashVerification {
    let Some(stored) = stored_hash else {
        return HashVerification {
            hash_valid: false,
            computed_hash: None,
            stored_hash: None,
        };
    };
    let computed = fingerprint::content_hash(content);
    HashVerification {
        hash_valid: computed == stored,
        computed_hash: Some(computed),
        stored_hash: Some(stored.to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub document_id: String,
    pub doc_id: Option<String>,
    pub quality_score: f64,
    pub checks: BTreeMap<String, bool>,
    pub status: &'static str,
    pub issues: Vec<String>,
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Per-document quality check. Critical checks (content present, hash
/// intact, required metadata) weigh 70% of the score; the rest 30%.
/// `pass` requires score ≥ 0.8 and zero issues.
pub fn verify_content_quality(point: &Point) -> QualityReport {
    let mut checks: BTreeMap<String, bool> = BTreeMap::new();
    let mut issues: Vec<String> = Vec::new();

    let content = payload_content(&point.payload);
    let meta = payload_meta(&point.payload);

    checks.insert("has_content".into(), !content.is_empty());
    if content.is_empty() {
        issues.push("document has no content".into());
    }

    checks.insert("min_length".into(), content.len() >= MIN_CONTENT_LENGTH);
    if content.len() < MIN_CONTENT_LENGTH {
        issues.push(format!(
            "content too short: {} characters (minimum: {MIN_CONTENT_LENGTH})",
            content.len()
        ));
    }

    let placeholders = detect_placeholders(content);
    checks.insert("no_placeholders".into(), !placeholders.has_placeholder);
    if placeholders.has_placeholder {
        issues.push(format!(
            "found {} placeholder(s): {}",
            placeholders.placeholder_count,
            placeholders.placeholder_types.join(", ")
        ));
    }

    checks.insert("has_metadata".into(), !meta.is_empty());
    if meta.is_empty() {
        issues.push("document has no metadata".into());
    }

    let missing: Vec<&str> = REQUIRED_METADATA_FIELDS
        .iter()
        .copied()
        .filter(|field| {
            !matches!(meta.get(*field), Some(v) if !matches!(v, Value::Null) && v.as_str() != Some(""))
        })
        .collect();
    checks.insert("has_required_metadata".into(), missing.is_empty());
    if !missing.is_empty() {
        issues.push(format!(
            "missing required metadata fields: {}",
            missing.join(", ")
        ));
    }

    let category = meta.get("category").and_then(Value::as_str).unwrap_or("");
    let has_file_path = meta.contains_key("file_path") || meta.contains_key("path");
    checks.insert("has_file_path".into(), has_file_path);
    if !has_file_path && FILE_BACKED_CATEGORIES.contains(&category) {
        issues.push("document should have file_path but it's missing".into());
    }

    let stored_hash = meta
        .get("hash_content")
        .or_else(|| meta.get("content_hash"))
        .and_then(Value::as_str);
    let hash_check = verify_hash_integrity(content, stored_hash);
    checks.insert("hash_valid".into(), hash_check.hash_valid);
    if !hash_check.hash_valid {
        if hash_check.stored_hash.is_none() {
            issues.push("hash verification failed: no stored hash found in metadata".into());
        } else {
            issues.push("content hash mismatch - possible corruption".into());
        }
    }

    let status_value = meta.get("status").and_then(Value::as_str);
    checks.insert("has_status".into(), status_value.is_some());
    match status_value {
        None => issues.push("document missing status field".into()),
        Some(s) if !schema::VALID_STATUSES.contains(&s) => {
            issues.push(format!("invalid status value: {s}"));
        }
        Some(_) => {}
    }

    const CRITICAL: [&str; 3] = ["has_content", "hash_valid", "has_required_metadata"];
    let critical_passed = checks
        .iter()
        .filter(|(k, v)| CRITICAL.contains(&k.as_str()) && **v)
        .count();
    let critical_score = critical_passed as f64 / CRITICAL.len() as f64;

    let normal_total = checks.len() - CRITICAL.len();
    let normal_passed = checks
        .iter()
        .filter(|(k, v)| !CRITICAL.contains(&k.as_str()) && **v)
        .count();
    let normal_score = if normal_total == 0 {
        1.0
    } else {
        normal_passed as f64 / normal_total as f64
    };

    let quality_score = round3(critical_score * 0.7 + normal_score * 0.3);
    let status = if quality_score >= 0.8 && issues.is_empty() {
        "pass"
    } else {
        "fail"
    };

    QualityReport {
        document_id: point.id_string(),
        doc_id: meta.get("doc_id").and_then(Value::as_str).map(str::to_string),
        quality_score,
        checks,
        status,
        issues,
    }
}

// ---------------------------------------------------------------------------
// Bulk category verification.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CategoryVerification {
    pub category: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub average_quality_score: f64,
    pub issue_counts: BTreeMap<String, usize>,
    pub failed_documents: Vec<QualityReport>,
}

/// Verify every document in a category across the given collections.
pub fn bulk_verify_category(
    store: &dyn VectorStore,
    collections: &[&str],
    category: &str,
    max_documents: Option<usize>,
) -> Result<CategoryVerification> {
    let filter = crate::filter::FilterNode::eq("meta.category", category).to_store_filter()?;

    let mut points: Vec<Point> = Vec::new();
    for collection in collections {
        points.extend(scroll_all(store, collection, Some(&filter), true, false)?);
    }
    if let Some(max) = max_documents {
        points.truncate(max);
    }

    let reports: Vec<QualityReport> = points.iter().map(verify_content_quality).collect();
    let total = reports.len();
    let passed = reports.iter().filter(|r| r.status == "pass").count();
    let failed = total - passed;
    let average = if total == 0 {
        0.0
    } else {
        reports.iter().map(|r| r.quality_score).sum::<f64>() / total as f64
    };

    let mut issue_counts: BTreeMap<String, usize> = BTreeMap::new();
    let failed_documents: Vec<QualityReport> = reports
        .into_iter()
        .filter(|r| r.status == "fail")
        .collect();
    for report in &failed_documents {
        for issue in &report.issues {
            let key = issue.split(':').next().unwrap_or(issue).to_string();
            *issue_counts.entry(key).or_insert(0) += 1;
        }
    }

    Ok(CategoryVerification {
        category: category.to_string(),
        total,
        passed,
        failed,
        pass_rate: if total == 0 {
            0.0
        } else {
            round3(passed as f64 / total as f64 * 100.0)
        },
        average_quality_score: round3(average),
        issue_counts,
        failed_documents,
    })
}

// ---------------------------------------------------------------------------
// Storage-integrity audit.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MismatchEntry {
    pub file_path: String,
    pub stored_hash: String,
    pub source_hash: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub total_documents: usize,
    pub total_files: Option<usize>,
    pub stored_files: usize,
    pub missing_files: Vec<String>,
    pub content_mismatches: Vec<MismatchEntry>,
    pub passed: usize,
    pub failed: usize,
    pub integrity_score: f64,
    pub failed_documents: Vec<QualityReport>,
    pub source_directory: Option<String>,
    pub timestamp: String,
}

/// Walk a source directory, honoring the extension filter.
fn scan_source_files(
    source_dir: &Path,
    recursive: bool,
    file_extensions: Option<&[String]>,
) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(source_dir);
    builder.standard_filters(true);
    if !recursive {
        builder.max_depth(Some(1));
    }

    let mut files: Vec<PathBuf> = builder
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.into_path())
        .filter(|path| match file_extensions {
            Some(extensions) if !extensions.is_empty() => {
                let suffix = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{e}"))
                    .unwrap_or_default();
                extensions.iter().any(|wanted| wanted == &suffix)
            }
            _ => true,
        })
        .collect();
    files.sort();
    files
}

/// Audit storage integrity against an optional source directory.
///
/// Stored points are matched to source files by their `file_path` (raw,
/// canonical, and source-relative variants all count). Each source file is
/// classified as matched-equal, matched-mismatched (normalized content
/// hash diverges), or missing from the store. The integrity score is
/// (total_files − missing − mismatches) / total_files when a source
/// directory is given, otherwise passed/total over stored documents.
pub fn audit_storage_integrity(
    store: &dyn VectorStore,
    collections: &[&str],
    source_directory: Option<&Path>,
    recursive: bool,
    file_extensions: Option<&[String]>,
) -> Result<AuditReport> {
    let mut all_points: Vec<Point> = Vec::new();
    for collection in collections {
        all_points.extend(scroll_all(store, collection, None, true, false)?);
    }

    // Map every stored file-path variant to the owning point.
    let mut stored_by_path: BTreeMap<String, usize> = BTreeMap::new();
    for (index, point) in all_points.iter().enumerate() {
        let meta = payload_meta(&point.payload);
        let file_path = meta
            .get("file_path")
            .or_else(|| meta.get("path"))
            .and_then(Value::as_str);
        if let Some(raw) = file_path {
            stored_by_path.insert(raw.to_string(), index);
            if let Ok(canonical) = std::fs::canonicalize(raw) {
                stored_by_path.insert(canonical.to_string_lossy().into_owned(), index);
            }
        }
    }
    let stored_files = stored_by_path.len();

    let reports: Vec<QualityReport> = all_points.iter().map(verify_content_quality).collect();
    let total_documents = reports.len();
    let passed = reports.iter().filter(|r| r.status == "pass").count();
    let failed = total_documents - passed;

    let mut missing_files: Vec<String> = Vec::new();
    let mut content_mismatches: Vec<MismatchEntry> = Vec::new();
    let mut total_files: Option<usize> = None;

    if let Some(source_dir) = source_directory {
        let files = scan_source_files(source_dir, recursive, file_extensions);
        total_files = Some(files.len());

        // Parallel read + hash over the source sweep; matching stays
        // sequential.
        let hashed: Vec<(PathBuf, String)> = files
            .par_iter()
            .filter_map(|path| {
                let content = std::fs::read_to_string(path).ok()?;
                Some((path.clone(), fingerprint::content_hash(&content)))
            })
            .collect();

        for (path, source_hash) in hashed {
            let relative = path
                .strip_prefix(source_dir)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let canonical = std::fs::canonicalize(&path)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let raw = path.to_string_lossy().into_owned();

            let matched = [canonical.as_str(), relative.as_str(), raw.as_str()]
                .iter()
                .filter(|v| !v.is_empty())
                .find_map(|variant| stored_by_path.get(*variant));

            match matched {
                None => missing_files.push(raw),
                Some(&index) => {
                    let point = &all_points[index];
                    let meta = payload_meta(&point.payload);
                    let stored_hash = meta
                        .get("hash_content")
                        .or_else(|| meta.get("content_hash"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !stored_hash.is_empty() && stored_hash != source_hash {
                        content_mismatches.push(MismatchEntry {
                            file_path: raw,
                            stored_hash: stored_hash.to_string(),
                            source_hash,
                            document_id: point.id_string(),
                        });
                    }
                }
            }
        }
    }

    let integrity_score = match total_files {
        Some(0) => 0.0,
        Some(count) => {
            let ok = count
                .saturating_sub(missing_files.len())
                .saturating_sub(content_mismatches.len());
            round3(ok as f64 / count as f64)
        }
        None => {
            if total_documents == 0 {
                0.0
            } else {
                round3(passed as f64 / total_documents as f64)
            }
        }
    };

    Ok(AuditReport {
        total_documents,
        total_files,
        stored_files,
        missing_files,
        content_mismatches,
        passed,
        failed,
        integrity_score,
        failed_documents: reports.into_iter().filter(|r| r.status == "fail").collect(),
        source_directory: source_directory.map(|p| p.to_string_lossy().into_owned()),
        timestamp: schema::utc_timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn point_with(content: &str, meta: Value) -> Point {
        let payload: Map<String, Value> =
            serde_json::from_value(json!({ "content": content, "meta": meta })).unwrap();
        Point::new(json!("p1"), payload, None)
    }

    fn good_content() -> String {
        "A perfectly reasonable document body that comfortably clears the minimum \
         length threshold for quality checks in this pipeline."
            .to_string()
    }

    #[test]
    fn placeholder_detection_finds_markers() {
        let report = detect_placeholders("Intro [TODO: write the rest] and [...] done");
        assert!(report.has_placeholder);
        assert_eq!(report.placeholder_count, 2);

        let clean = detect_placeholders("Nothing unusual here.");
        assert!(!clean.has_placeholder);
    }

    #[test]
    fn hash_integrity_detects_divergence() {
        let content = "some content";
        let good = fingerprint::content_hash(content);
        assert!(verify_hash_integrity(content, Some(&good)).hash_valid);
        assert!(!verify_hash_integrity(content, Some("bogus")).hash_valid);
        assert!(!verify_hash_integrity(content, None).hash_valid);
    }

    #[test]
    fn well_formed_document_passes() {
        let content = good_content();
        let point = point_with(
            &content,
            json!({
                "doc_id": "d1",
                "version": "v1",
                "category": "design_doc",
                "hash_content": fingerprint::content_hash(&content),
                "status": "active",
                "file_path": "docs/design.md",
            }),
        );
        let report = verify_content_quality(&point);
        assert_eq!(report.status, "pass", "issues: {:?}", report.issues);
        assert!(report.quality_score >= 0.8);
    }

    #[test]
    fn hash_mismatch_fails_with_issue() {
        let content = good_content();
        let point = point_with(
            &content,
            json!({
                "doc_id": "d1",
                "version": "v1",
                "category": "design_doc",
                "hash_content": "tampered",
                "status": "active",
                "file_path": "x.md",
            }),
        );
        let report = verify_content_quality(&point);
        assert_eq!(report.status, "fail");
        assert!(!report.checks["hash_valid"]);
        assert!(report.issues.iter().any(|i| i.contains("hash mismatch")));
    }

    #[test]
    fn short_placeholder_content_fails() {
        let point = point_with(
            "[TODO: fill]",
            json!({
                "doc_id": "d1",
                "version": "v1",
                "category": "other",
                "hash_content": fingerprint::content_hash("[TODO: fill]"),
                "status": "active",
            }),
        );
        let report = verify_content_quality(&point);
        assert_eq!(report.status, "fail");
        assert!(!report.checks["min_length"]);
        assert!(!report.checks["no_placeholders"]);
    }

    #[test]
    fn file_backed_category_requires_file_path() {
        let content = good_content();
        let point = point_with(
            &content,
            json!({
                "doc_id": "d1",
                "version": "v1",
                "category": "user_rule",
                "hash_content": fingerprint::content_hash(&content),
                "status": "active",
            }),
        );
        let report = verify_content_quality(&point);
        assert!(report
            .issues
            .iter()
            .any(|i| i.contains("should have file_path")));
    }
}
