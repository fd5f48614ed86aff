use serde::Serialize;

use crate::config::ChunkingConfig;
use crate::error::{PipelineError, Result};
use crate::fingerprint;
use crate::store::{payload_meta_field, Point};

// ---------------------------------------------------------------------------
// Recursive chunker.
//
// Long documents are split into stable, hash-addressed windows so that a
// revision only re-embeds the windows that actually changed. The splitter
// attempts separators in priority order (paragraph → line → sentence →
// word), falling back to the next separator whenever a piece would still
// exceed the target size, and finally to a hard character split.
//
// Chunk identity is fully deterministic: `{parent_doc_id}_chunk_{index}`
// with a content hash over the chunk text via the shared normalization.
// Re-chunking the same input with the same parameters reproduces the same
// chunk count, IDs, and hashes on any machine.
// ---------------------------------------------------------------------------

/// Natural split boundaries, in priority order: paragraphs, lines,
/// sentences, words.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Stable chunk ID for a (parent, index) pair.
pub fn chunk_id(doc_id: &str, chunk_index: usize) -> String {
    format!("{doc_id}_chunk_{chunk_index}")
}

/// A freshly produced chunk, not yet stored.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub chunk_index: usize,
    pub parent_doc_id: String,
    pub total_chunks: usize,
    pub content: String,
    /// Content hash of the chunk text (shared normalization).
    pub hash_content: String,
}

/// Split a document into chunks with deterministic IDs and hashes.
///
/// Empty content yields an empty chunk list; non-empty content is
/// guaranteed at least one chunk (a zero-chunk outcome is reported as
/// `ChunkingFailed`).
pub fn chunk_document(content: &str, doc_id: &str, params: &ChunkingConfig) -> Result<Vec<Chunk>> {
    if content.is_empty() {
        return Ok(Vec::new());
    }

    let chars_per_token = params.chars_per_token.max(1);
    let max_chars = (params.chunk_size * chars_per_token).max(1);
    let overlap_chars = params.chunk_overlap * chars_per_token;

    let pieces = split_recursive(content, &DEFAULT_SEPARATORS, max_chars);
    if pieces.is_empty() {
        return Err(PipelineError::ChunkingFailed(format!(
            "splitter produced zero chunks for doc '{doc_id}' ({} bytes)",
            content.len()
        )));
    }

    let total_chunks = pieces.len();
    let chunks = pieces
        .iter()
        .enumerate()
        .map(|(index, piece)| {
            let text = if index == 0 || overlap_chars == 0 {
                piece.clone()
            } else {
                // Prefix with the tail of the previous window for context
                // continuity across chunk boundaries.
                format!("{}{}", tail_chars(&pieces[index - 1], overlap_chars), piece)
            };
            Chunk {
                chunk_id: chunk_id(doc_id, index),
                chunk_index: index,
                parent_doc_id: doc_id.to_string(),
                total_chunks,
                hash_content: fingerprint::content_hash(&text),
                content: text,
            }
        })
        .collect();

    Ok(chunks)
}

/// Recursive split: try the highest-priority separator; any piece still over
/// budget falls through to the next separator, and ultimately to a hard
/// character split.
fn split_recursive(text: &str, separators: &[&str], max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let Some((separator, rest)) = separators.split_first() else {
        return hard_split(text, max_chars);
    };

    let pieces = split_keeping_separator(text, separator);
    if pieces.len() == 1 {
        // Separator not present; fall through.
        return split_recursive(text, rest, max_chars);
    }

    // Greedy merge: pack pieces into windows up to max_chars.
    let mut out: Vec<String> = Vec::new();
    let mut buffer = String::new();
    for piece in pieces {
        if piece.len() > max_chars {
            if !buffer.is_empty() {
                out.push(std::mem::take(&mut buffer));
            }
            out.extend(split_recursive(&piece, rest, max_chars));
        } else if !buffer.is_empty() && buffer.len() + piece.len() > max_chars {
            out.push(std::mem::take(&mut buffer));
            buffer.push_str(&piece);
        } else {
            buffer.push_str(&piece);
        }
    }
    if !buffer.is_empty() {
        out.push(buffer);
    }
    out
}

/// Split on `separator`, keeping the separator attached to the end of each
/// piece so concatenating the pieces reproduces the input.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(separator) {
        let end = pos + separator.len();
        pieces.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    if pieces.is_empty() {
        pieces.push(text.to_string());
    }
    pieces
}

/// Last-resort split at (char-safe) fixed width.
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_chars && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Last `n` characters of a string, char-boundary safe.
fn tail_chars(text: &str, n: usize) -> &str {
    let char_count = text.chars().count();
    if char_count <= n {
        return text;
    }
    let skip = char_count - n;
    match text.char_indices().nth(skip) {
        Some((byte_index, _)) => &text[byte_index..],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Chunk-set diff.
// ---------------------------------------------------------------------------

/// A chunk as currently stored: the point plus its parsed index and hash.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub point: Point,
    pub chunk_index: usize,
    pub hash_content: String,
}

impl StoredChunk {
    /// Parse a stored point into a chunk view. Returns `None` when the point
    /// carries no usable chunk_index.
    pub fn from_point(point: Point) -> Option<StoredChunk> {
        let chunk_index = payload_meta_field(&point.payload, "chunk_index")?
            .as_u64()? as usize;
        let hash_content = payload_meta_field(&point.payload, "hash_content")
            .or_else(|| payload_meta_field(&point.payload, "content_hash"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Some(StoredChunk {
            point,
            chunk_index,
            hash_content,
        })
    }
}

/// Classification of an old/new chunk pairing by `chunk_index`.
///
/// Every old index lands in exactly one of {unchanged, changed, deleted};
/// every new index in exactly one of {unchanged, changed, new}.
#[derive(Debug, Default)]
pub struct ChunkDiff {
    /// Same index, same hash: carried forward, never re-embedded.
    pub unchanged: Vec<StoredChunk>,
    /// Same index, different hash: re-embed, deprecate the old record.
    pub changed: Vec<Chunk>,
    /// Index present only in the new list: embed and write.
    pub new: Vec<Chunk>,
    /// Index present only in the old list: deprecate.
    pub deleted: Vec<StoredChunk>,
}

pub fn diff_chunks(old_chunks: &[StoredChunk], new_chunks: &[Chunk]) -> ChunkDiff {
    let mut old_by_index: std::collections::BTreeMap<usize, &StoredChunk> = old_chunks
        .iter()
        .map(|chunk| (chunk.chunk_index, chunk))
        .collect();

    let mut diff = ChunkDiff::default();

    for new_chunk in new_chunks {
        match old_by_index.remove(&new_chunk.chunk_index) {
            Some(old_chunk) if old_chunk.hash_content == new_chunk.hash_content => {
                diff.unchanged.push(old_chunk.clone());
            }
            Some(_) => diff.changed.push(new_chunk.clone()),
            None => diff.new.push(new_chunk.clone()),
        }
    }

    diff.deleted.extend(old_by_index.into_values().cloned());
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn params(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
            chars_per_token: 4,
        }
    }

    fn stored(index: usize, hash: &str) -> StoredChunk {
        let payload: Map<String, Value> = serde_json::from_value(json!({
            "content": "x",
            "meta": { "chunk_index": index, "hash_content": hash }
        }))
        .unwrap();
        StoredChunk::from_point(Point::new(json!(format!("p{index}")), payload, None)).unwrap()
    }

    #[test]
    fn chunk_ids_are_stable_across_runs() {
        let content = "alpha\n\nbravo\n\ncharlie\n\ndelta".repeat(40);
        let a = chunk_document(&content, "doc-1", &params(16, 4)).unwrap();
        let b = chunk_document(&content, "doc-1", &params(16, 4)).unwrap();

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.chunk_id, y.chunk_id);
            assert_eq!(x.hash_content, y.hash_content);
        }
        // 0-based, contiguous indexing with consistent total.
        for (i, chunk) in a.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.chunk_id, format!("doc-1_chunk_{i}"));
            assert_eq!(chunk.total_chunks, a.len());
        }
    }

    #[test]
    fn small_content_is_a_single_chunk() {
        let chunks = chunk_document("short note", "d", &params(512, 50)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "short note");
    }

    #[test]
    fn empty_content_yields_no_chunks() {
        assert!(chunk_document("", "d", &params(512, 50)).unwrap().is_empty());
    }

    #[test]
    fn paragraph_boundaries_win_over_lines() {
        // Two paragraphs, each under budget: the split must land on the
        // paragraph boundary, not mid-paragraph.
        let content = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = chunk_document(&content, "d", &params(10, 0)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.starts_with('a'));
        assert!(chunks[1].content.starts_with('b'));
    }

    #[test]
    fn separator_free_text_hard_splits_on_char_boundaries() {
        let content = "é".repeat(100); // 2 bytes per char, no separators
        let chunks = chunk_document(&content, "d", &params(4, 0)).unwrap();
        assert!(chunks.len() > 1);
        let reassembled: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(reassembled, content);
    }

    #[test]
    fn overlap_prefixes_with_previous_tail() {
        let content = format!("{}\n\n{}", "a".repeat(40), "b".repeat(40));
        let chunks = chunk_document(&content, "d", &params(11, 1)).unwrap();
        assert_eq!(chunks.len(), 2);
        // 1 token of overlap = the last 4 chars of chunk 0 ("aa\n\n").
        assert!(chunks[1].content.starts_with("aa\n\nbbbb"));
    }

    #[test]
    fn diff_classifies_each_index_exactly_once() {
        let old = vec![
            stored(0, "h0"),
            stored(1, "h1"),
            stored(2, "h2"),
            stored(3, "h3"),
        ];
        let mk = |index: usize, hash: &str| Chunk {
            chunk_id: chunk_id("d", index),
            chunk_index: index,
            parent_doc_id: "d".into(),
            total_chunks: 4,
            content: String::new(),
            hash_content: hash.into(),
        };
        // 0 unchanged, 1 changed, 2 deleted (missing), 3 unchanged, 4 new.
        let new = vec![mk(0, "h0"), mk(1, "h1-modified"), mk(3, "h3"), mk(4, "h4")];

        let diff = diff_chunks(&old, &new);
        assert_eq!(diff.unchanged.len(), 2);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].chunk_index, 2);

        // Completeness: unions cover both sides exactly.
        assert_eq!(
            diff.unchanged.len() + diff.changed.len() + diff.new.len(),
            new.len()
        );
        assert_eq!(
            diff.unchanged.len() + diff.changed.len() + diff.deleted.len(),
            old.len()
        );
    }

    #[test]
    fn diff_of_identical_sets_is_all_unchanged() {
        let content = "one\n\ntwo\n\nthree";
        let chunks = chunk_document(content, "d", &params(2, 0)).unwrap();
        let old: Vec<StoredChunk> = chunks
            .iter()
            .map(|c| stored(c.chunk_index, &c.hash_content))
            .collect();
        let diff = diff_chunks(&old, &chunks);
        assert_eq!(diff.unchanged.len(), chunks.len());
        assert!(diff.changed.is_empty());
        assert!(diff.new.is_empty());
        assert!(diff.deleted.is_empty());
    }
}
