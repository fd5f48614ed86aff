use anyhow::Result;
use serde_json::{json, Map, Value};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::bulk::{self, DuplicatePolicy};
use crate::backup;
use crate::config::ChunkingConfig;
use crate::context::{ContentType, PipelineContext};
use crate::error::PipelineError;
use crate::filter::FilterNode;
use crate::incremental;
use crate::ingest;
use crate::query;
use crate::update;
use crate::verify;

// ---------------------------------------------------------------------------
// MCP stdio server.
//
// A blocking JSON-RPC loop over stdin/stdout: one line in, one line out.
// Tool handlers parse their arguments, call into the pipeline, and wrap the
// outcome in a result envelope. Pipeline errors come back as structured
// `{status, error, kind}` objects with isError set; nothing is re-raised
// across the protocol boundary.
// ---------------------------------------------------------------------------

pub struct ServerState {
    ctx: PipelineContext,
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

fn arg_map(args: &Value, key: &str) -> Map<String, Value> {
    args.get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn arg_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn arg_usize(args: &Value, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(default)
}

impl ServerState {
    pub fn new(ctx: PipelineContext) -> ServerState {
        ServerState { ctx }
    }

    fn chunking_params(&self, args: &Value) -> ChunkingConfig {
        let mut params = self.ctx.config.chunking.clone();
        if let Some(size) = args.get("chunk_size").and_then(Value::as_u64) {
            params.chunk_size = size as usize;
        }
        if let Some(overlap) = args.get("chunk_overlap").and_then(Value::as_u64) {
            params.chunk_overlap = overlap as usize;
        }
        params
    }

    fn content_type(args: &Value) -> crate::error::Result<ContentType> {
        match arg_str(args, "content_type") {
            Some(raw) => ContentType::parse(raw),
            None => Ok(ContentType::Docs),
        }
    }

    fn tool_list(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "store_document",
                        "description": "Store a document in the vector store with content-addressed deduplication. Identical content+metadata is skipped, a new revision of a known doc_id deprecates the old version, and genuinely new material is embedded and written. Set chunked=true to split long documents into hash-addressed chunks.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "content": { "type": "string", "description": "Document text to index." },
                                "metadata": { "type": "object", "description": "Optional metadata (doc_id, category, file_path, tags, ...). Missing fields get defaults.", "additionalProperties": true },
                                "content_type": { "type": "string", "enum": ["docs", "code"], "description": "Routing: documentation collection (default) or code collection." },
                                "chunked": { "type": "boolean", "description": "Split into chunks before storing (for long documents)." },
                                "chunk_size": { "type": "integer", "description": "Target chunk size in tokens (default 512)." },
                                "chunk_overlap": { "type": "integer", "description": "Chunk overlap in tokens (default 50)." }
                            },
                            "required": ["content"]
                        }
                    },
                    {
                        "name": "store_file",
                        "description": "Read a UTF-8 file and store it as a document. The file path becomes the doc_id default and file metadata (file_name, hash of raw bytes) is attached.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "file_path": { "type": "string" },
                                "metadata": { "type": "object", "additionalProperties": true }
                            },
                            "required": ["file_path"]
                        }
                    },
                    {
                        "name": "store_code",
                        "description": "Store a code file in the code collection using the code embedding model. The programming language is detected from the file extension unless provided.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "file_path": { "type": "string" },
                                "language": { "type": "string", "description": "Optional language override (e.g. 'rust', 'python')." },
                                "metadata": { "type": "object", "additionalProperties": true }
                            },
                            "required": ["file_path"]
                        }
                    },
                    {
                        "name": "search_documents",
                        "description": "Semantic search over the stored documents. Optionally restricted to one collection and narrowed by a metadata filter ({field, operator, value} comparisons composable with AND/OR/NOT).",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string" },
                                "top_k": { "type": "integer", "default": 10, "minimum": 1, "maximum": 50 },
                                "content_type": { "type": "string", "enum": ["all", "docs", "code"], "default": "all" },
                                "filters": { "type": "object", "description": "Optional metadata filter in the comparison/logic node format." }
                            },
                            "required": ["query"]
                        }
                    },
                    {
                        "name": "update_document",
                        "description": "Single-point updates. Actions: 'content' atomically re-embeds and rewrites one point; 'metadata' patches metadata preserving the stored vector; 'deprecate' marks a version deprecated; 'history' lists all versions of a doc_id sorted by (version, created_at).",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "action": { "type": "string", "enum": ["content", "metadata", "deprecate", "history"] },
                                "document_id": { "type": "string", "description": "(content/metadata/deprecate) Store point ID." },
                                "content": { "type": "string", "description": "(content) New document content." },
                                "metadata": { "type": "object", "description": "(content/metadata) Metadata patch.", "additionalProperties": true },
                                "doc_id": { "type": "string", "description": "(history) Logical document ID." },
                                "category": { "type": "string", "description": "(history) Optional category filter." },
                                "include_deprecated": { "type": "boolean", "default": true },
                                "content_type": { "type": "string", "enum": ["docs", "code"] }
                            },
                            "required": ["action"]
                        }
                    },
                    {
                        "name": "update_chunked_document",
                        "description": "Incrementally re-index a revised document that was stored in chunks: unchanged chunks are preserved (no re-embedding), changed chunks are re-embedded and their old versions deprecated, removed chunks are deprecated.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "content": { "type": "string", "description": "The full new revision." },
                                "doc_id": { "type": "string", "description": "Parent document ID." },
                                "metadata": { "type": "object", "additionalProperties": true },
                                "content_type": { "type": "string", "enum": ["docs", "code"] },
                                "chunk_size": { "type": "integer" },
                                "chunk_overlap": { "type": "integer" }
                            },
                            "required": ["content", "doc_id"]
                        }
                    },
                    {
                        "name": "bulk_operations",
                        "description": "Bulk maintenance built on scroll+mutate. Actions: 'delete_by_filter', 'delete_by_ids', 'update_by_filter' (metadata patch across matches), 'export' (serialize matching points), 'import' (load records with a duplicate policy of skip | update | error).",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "action": { "type": "string", "enum": ["delete_by_filter", "delete_by_ids", "update_by_filter", "export", "import"] },
                                "filter": { "type": "object", "description": "(delete_by_filter/update_by_filter/export) Metadata filter node." },
                                "ids": { "type": "array", "items": {}, "description": "(delete_by_ids) Point IDs." },
                                "metadata": { "type": "object", "description": "(update_by_filter) Patch to merge into each match.", "additionalProperties": true },
                                "include_embeddings": { "type": "boolean", "default": false },
                                "documents": { "type": "array", "items": { "type": "object" }, "description": "(import) Records: {id?, content, meta, embedding?}." },
                                "duplicate_policy": { "type": "string", "enum": ["skip", "update", "error"], "default": "skip" },
                                "embed": { "type": "boolean", "description": "(import) Re-embed records instead of using carried embeddings.", "default": true },
                                "content_type": { "type": "string", "enum": ["docs", "code"] }
                            },
                            "required": ["action"]
                        }
                    },
                    {
                        "name": "backup",
                        "description": "Local backup management. 'create' snapshots the collections into a timestamped directory with a checksum manifest; 'restore' verifies every checksum and loads the points back (aborting on any corruption before writing); 'list' enumerates existing backups.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "action": { "type": "string", "enum": ["create", "restore", "list"] },
                                "backup_dir": { "type": "string", "description": "Backup root directory (defaults to the configured one)." },
                                "backup_path": { "type": "string", "description": "(restore) Path to one backup directory." },
                                "include_embeddings": { "type": "boolean", "default": false },
                                "include_code": { "type": "boolean", "default": true, "description": "(create) Also back up the code collection." },
                                "filters": { "type": "object", "description": "(create) Optional metadata filter node." },
                                "skip_existing": { "type": "boolean", "default": true, "description": "(restore) Skip point IDs already present." },
                                "verify_after_restore": { "type": "boolean", "default": true }
                            },
                            "required": ["action"]
                        }
                    },
                    {
                        "name": "verify_documents",
                        "description": "Quality and integrity checks. 'check' verifies one stored point (placeholders, minimum length, required metadata, hash integrity); 'category' verifies every document of a category; 'audit' compares the store against a source directory and reports missing files and content mismatches with an integrity score.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "action": { "type": "string", "enum": ["check", "category", "audit"] },
                                "document_id": { "type": "string", "description": "(check) Store point ID." },
                                "category": { "type": "string", "description": "(category) Category to verify." },
                                "max_documents": { "type": "integer", "description": "(category) Cap on documents verified." },
                                "source_directory": { "type": "string", "description": "(audit) Directory to compare against." },
                                "recursive": { "type": "boolean", "default": true },
                                "extensions": { "type": "array", "items": { "type": "string" }, "description": "(audit) Extension allowlist, e.g. ['.md', '.txt']." },
                                "content_type": { "type": "string", "enum": ["docs", "code"] }
                            },
                            "required": ["action"]
                        }
                    },
                    {
                        "name": "get_stats",
                        "description": "Point counts per collection plus value histograms over metadata fields (category / status / source by default). Administrative; scans the filtered collection.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "filters": { "type": "object" },
                                "group_by": { "type": "array", "items": { "type": "string" } },
                                "content_type": { "type": "string", "enum": ["docs", "code"], "default": "docs" }
                            }
                        }
                    }
                ]
            }
        })
    }

    fn tool_call(&mut self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));
        let max_chars = negotiated_max_chars(&args);

        let ok = |value: Value| {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            let text = force_inline_truncate(text, max_chars);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type": "text", "text": text }], "isError": false }
            })
        };

        let err = |msg: String| {
            let msg = force_inline_truncate(msg, max_chars);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type": "text", "text": msg }], "isError": true }
            })
        };

        let fail = |e: PipelineError| {
            let text = serde_json::to_string_pretty(&e.to_envelope())
                .unwrap_or_else(|_| e.to_string());
            let text = force_inline_truncate(text, max_chars);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type": "text", "text": text }], "isError": true }
            })
        };

        macro_rules! unwrap_or_fail {
            ($expr:expr) => {
                match $expr {
                    Ok(v) => v,
                    Err(e) => return fail(e),
                }
            };
        }

        match name {
            "store_document" => {
                let Some(content) = arg_str(&args, "content") else {
                    return err("Error: store_document requires a non-empty 'content' parameter.".into());
                };
                let metadata = arg_map(&args, "metadata");
                let content_type = unwrap_or_fail!(Self::content_type(&args));
                let collection = self.ctx.collection_for(content_type).to_string();
                let embedder = self.ctx.embedder_for(content_type);

                if arg_bool(&args, "chunked", false) {
                    let doc_id = metadata
                        .get("doc_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            format!(
                                "doc_{}",
                                &crate::fingerprint::sha256_hex(content.as_bytes())[..16]
                            )
                        });
                    let params = self.chunking_params(&args);
                    let outcome = unwrap_or_fail!(ingest::store_chunked_document(
                        self.ctx.store.as_ref(),
                        embedder,
                        &collection,
                        content,
                        &doc_id,
                        &metadata,
                        &params,
                    ));
                    return ok(json!(outcome));
                }

                let outcome = unwrap_or_fail!(ingest::store_document(
                    self.ctx.store.as_ref(),
                    embedder,
                    &collection,
                    content,
                    &metadata,
                ));
                ok(json!(outcome))
            }

            "store_file" => {
                let Some(file_path) = arg_str(&args, "file_path") else {
                    return err("Error: store_file requires the 'file_path' parameter.".into());
                };
                let metadata = arg_map(&args, "metadata");
                let collection = self.ctx.collection_for(ContentType::Docs).to_string();
                let outcome = unwrap_or_fail!(ingest::store_file(
                    self.ctx.store.as_ref(),
                    self.ctx.embedder_for(ContentType::Docs),
                    &collection,
                    file_path,
                    &metadata,
                ));
                ok(json!(outcome))
            }

            "store_code" => {
                let Some(file_path) = arg_str(&args, "file_path") else {
                    return err("Error: store_code requires the 'file_path' parameter.".into());
                };
                let metadata = arg_map(&args, "metadata");
                let language = arg_str(&args, "language");
                let collection = self.ctx.collection_for(ContentType::Code).to_string();
                let outcome = unwrap_or_fail!(ingest::store_code_file(
                    self.ctx.store.as_ref(),
                    self.ctx.embedder_for(ContentType::Code),
                    &collection,
                    file_path,
                    language,
                    &metadata,
                ));
                ok(json!(outcome))
            }

            "search_documents" => {
                let Some(query_text) = arg_str(&args, "query") else {
                    return err("Error: search_documents requires a non-empty 'query' parameter.".into());
                };
                let top_k = arg_usize(&args, "top_k", query::DEFAULT_TOP_K);
                let filters = match args.get("filters") {
                    None | Some(Value::Null) => None,
                    Some(raw) => Some(unwrap_or_fail!(FilterNode::parse(raw))),
                };

                let targets: Vec<ContentType> = match arg_str(&args, "content_type") {
                    None | Some("all") => vec![ContentType::Docs, ContentType::Code],
                    Some(raw) => vec![unwrap_or_fail!(ContentType::parse(raw))],
                };

                let mut hits: Vec<Value> = Vec::new();
                for content_type in targets {
                    let collection = self.ctx.collection_for(content_type).to_string();
                    let scored = unwrap_or_fail!(query::search_with_filters(
                        self.ctx.store.as_ref(),
                        &collection,
                        query_text,
                        self.ctx.embedder_for(content_type),
                        filters.as_ref(),
                        top_k,
                    ));
                    for hit in scored {
                        hits.push(json!({
                            "id": hit.point.id,
                            "score": hit.score,
                            "collection": collection,
                            "content": crate::store::payload_content(&hit.point.payload),
                            "meta": crate::store::payload_meta(&hit.point.payload),
                        }));
                    }
                }
                hits.sort_by(|a, b| {
                    let sa = a["score"].as_f64().unwrap_or(0.0);
                    let sb = b["score"].as_f64().unwrap_or(0.0);
                    sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
                });
                hits.truncate(top_k);
                ok(json!({ "status": "success", "query": query_text, "results": hits }))
            }

            "update_document" => {
                let action = arg_str(&args, "action").unwrap_or("");
                let content_type = unwrap_or_fail!(Self::content_type(&args));
                let collection = self.ctx.collection_for(content_type).to_string();
                match action {
                    "content" => {
                        let Some(document_id) = arg_str(&args, "document_id") else {
                            return err("Error: action 'content' requires 'document_id'.".into());
                        };
                        let Some(content) = arg_str(&args, "content") else {
                            return err("Error: action 'content' requires 'content'.".into());
                        };
                        let patch = arg_map(&args, "metadata");
                        let patch = (!patch.is_empty()).then_some(patch);
                        let outcome = unwrap_or_fail!(update::update_content(
                            self.ctx.store.as_ref(),
                            &collection,
                            &json!(document_id),
                            content,
                            self.ctx.embedder_for(content_type),
                            patch.as_ref(),
                        ));
                        ok(json!(outcome))
                    }
                    "metadata" => {
                        let Some(document_id) = arg_str(&args, "document_id") else {
                            return err("Error: action 'metadata' requires 'document_id'.".into());
                        };
                        let patch = arg_map(&args, "metadata");
                        if patch.is_empty() {
                            return err("Error: action 'metadata' requires a non-empty 'metadata' patch.".into());
                        }
                        let outcome = unwrap_or_fail!(update::update_metadata(
                            self.ctx.store.as_ref(),
                            &collection,
                            &json!(document_id),
                            &patch,
                        ));
                        ok(json!(outcome))
                    }
                    "deprecate" => {
                        let Some(document_id) = arg_str(&args, "document_id") else {
                            return err("Error: action 'deprecate' requires 'document_id'.".into());
                        };
                        let outcome = unwrap_or_fail!(update::deprecate(
                            self.ctx.store.as_ref(),
                            &collection,
                            &json!(document_id),
                        ));
                        ok(json!(outcome))
                    }
                    "history" => {
                        let Some(doc_id) = arg_str(&args, "doc_id") else {
                            return err("Error: action 'history' requires 'doc_id'.".into());
                        };
                        let category = arg_str(&args, "category");
                        let include_deprecated = arg_bool(&args, "include_deprecated", true);
                        let points = unwrap_or_fail!(update::get_version_history(
                            self.ctx.store.as_ref(),
                            &collection,
                            doc_id,
                            category,
                            include_deprecated,
                        ));
                        let versions: Vec<Value> = points
                            .iter()
                            .map(|p| {
                                json!({
                                    "id": p.id,
                                    "content": crate::store::payload_content(&p.payload),
                                    "meta": crate::store::payload_meta(&p.payload),
                                })
                            })
                            .collect();
                        ok(json!({ "status": "success", "doc_id": doc_id, "version_count": versions.len(), "versions": versions }))
                    }
                    other => err(format!(
                        "Error: invalid action for update_document: '{other}'. \
                         Choose one of: 'content', 'metadata', 'deprecate', 'history'."
                    )),
                }
            }

            "update_chunked_document" => {
                let Some(content) = arg_str(&args, "content") else {
                    return err("Error: update_chunked_document requires 'content'.".into());
                };
                let Some(doc_id) = arg_str(&args, "doc_id") else {
                    return err("Error: update_chunked_document requires 'doc_id'.".into());
                };
                let metadata = arg_map(&args, "metadata");
                let content_type = unwrap_or_fail!(Self::content_type(&args));
                let collection = self.ctx.collection_for(content_type).to_string();
                let params = self.chunking_params(&args);
                let outcome = unwrap_or_fail!(incremental::update_chunked_document(
                    self.ctx.store.as_ref(),
                    self.ctx.embedder_for(content_type),
                    &collection,
                    content,
                    doc_id,
                    &metadata,
                    &params,
                ));
                ok(json!(outcome))
            }

            "bulk_operations" => {
                let action = arg_str(&args, "action").unwrap_or("");
                let content_type = unwrap_or_fail!(Self::content_type(&args));
                let collection = self.ctx.collection_for(content_type).to_string();
                match action {
                    "delete_by_filter" => {
                        let Some(raw_filter) = args.get("filter") else {
                            return err("Error: action 'delete_by_filter' requires 'filter'.".into());
                        };
                        let filter = unwrap_or_fail!(FilterNode::parse(raw_filter));
                        let outcome = unwrap_or_fail!(bulk::delete_by_filter(
                            self.ctx.store.as_ref(),
                            &collection,
                            &filter,
                        ));
                        ok(json!(outcome))
                    }
                    "delete_by_ids" => {
                        let ids: Vec<Value> = args
                            .get("ids")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        let outcome = unwrap_or_fail!(bulk::delete_by_ids(
                            self.ctx.store.as_ref(),
                            &collection,
                            &ids,
                        ));
                        ok(json!(outcome))
                    }
                    "update_by_filter" => {
                        let Some(raw_filter) = args.get("filter") else {
                            return err("Error: action 'update_by_filter' requires 'filter'.".into());
                        };
                        let patch = arg_map(&args, "metadata");
                        if patch.is_empty() {
                            return err("Error: action 'update_by_filter' requires a non-empty 'metadata' patch.".into());
                        }
                        let filter = unwrap_or_fail!(FilterNode::parse(raw_filter));
                        let outcome = unwrap_or_fail!(bulk::update_metadata_by_filter(
                            self.ctx.store.as_ref(),
                            &collection,
                            &filter,
                            &patch,
                        ));
                        ok(json!(outcome))
                    }
                    "export" => {
                        let filter = match args.get("filter") {
                            None | Some(Value::Null) => None,
                            Some(raw) => Some(unwrap_or_fail!(FilterNode::parse(raw))),
                        };
                        let include_embeddings = arg_bool(&args, "include_embeddings", false);
                        let documents = unwrap_or_fail!(bulk::export_documents(
                            self.ctx.store.as_ref(),
                            &collection,
                            filter.as_ref(),
                            include_embeddings,
                        ));
                        ok(json!({ "status": "success", "document_count": documents.len(), "documents": documents }))
                    }
                    "import" => {
                        let Some(documents) = args.get("documents").and_then(Value::as_array) else {
                            return err("Error: action 'import' requires a 'documents' array.".into());
                        };
                        let policy = unwrap_or_fail!(DuplicatePolicy::parse(
                            arg_str(&args, "duplicate_policy").unwrap_or("skip")
                        ));
                        let embedder = arg_bool(&args, "embed", true)
                            .then(|| self.ctx.embedder_for(content_type));
                        let outcome = unwrap_or_fail!(bulk::import_documents(
                            self.ctx.store.as_ref(),
                            &collection,
                            documents,
                            policy,
                            embedder,
                        ));
                        ok(json!(outcome))
                    }
                    other => err(format!(
                        "Error: invalid action for bulk_operations: '{other}'. \
                         Choose one of: 'delete_by_filter', 'delete_by_ids', 'update_by_filter', 'export', 'import'."
                    )),
                }
            }

            "backup" => {
                let action = arg_str(&args, "action").unwrap_or("");
                let backup_dir: PathBuf = arg_str(&args, "backup_dir")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.ctx.config.backup_dir.clone());
                match action {
                    "create" => {
                        let include_embeddings = arg_bool(&args, "include_embeddings", false);
                        let code_collection = arg_bool(&args, "include_code", true)
                            .then(|| self.ctx.config.collections.code.clone());
                        let filters = args.get("filters").filter(|v| !v.is_null()).cloned();
                        let doc_collection = self.ctx.config.collections.documentation.clone();
                        let outcome = unwrap_or_fail!(backup::create_backup(
                            self.ctx.store.as_ref(),
                            &doc_collection,
                            code_collection.as_deref(),
                            &backup_dir,
                            include_embeddings,
                            filters.as_ref(),
                        ));
                        ok(json!(outcome))
                    }
                    "restore" => {
                        let Some(backup_path) = arg_str(&args, "backup_path") else {
                            return err("Error: action 'restore' requires 'backup_path'.".into());
                        };
                        let skip_existing = arg_bool(&args, "skip_existing", true);
                        let verify_after = arg_bool(&args, "verify_after_restore", true);
                        let doc_collection = self.ctx.config.collections.documentation.clone();
                        let code_collection = self.ctx.config.collections.code.clone();
                        let outcome = unwrap_or_fail!(backup::restore_backup(
                            self.ctx.store.as_ref(),
                            Path::new(backup_path),
                            &doc_collection,
                            Some(&code_collection),
                            skip_existing,
                            Some(self.ctx.doc_embedder.as_ref()),
                            Some(self.ctx.code_embedder.as_ref()),
                            verify_after,
                        ));
                        ok(json!(outcome))
                    }
                    "list" => {
                        let listing = unwrap_or_fail!(backup::list_backups(&backup_dir));
                        ok(json!(listing))
                    }
                    other => err(format!(
                        "Error: invalid action for backup: '{other}'. Choose one of: 'create', 'restore', 'list'."
                    )),
                }
            }

            "verify_documents" => {
                let action = arg_str(&args, "action").unwrap_or("");
                match action {
                    "check" => {
                        let Some(document_id) = arg_str(&args, "document_id") else {
                            return err("Error: action 'check' requires 'document_id'.".into());
                        };
                        let content_type = unwrap_or_fail!(Self::content_type(&args));
                        let collection = self.ctx.collection_for(content_type).to_string();
                        let points = unwrap_or_fail!(self.ctx.store.retrieve(
                            &collection,
                            &[json!(document_id)],
                            true,
                            false,
                        ));
                        let Some(point) = points.first() else {
                            return fail(PipelineError::NotFound(format!(
                                "document not found: {document_id}"
                            )));
                        };
                        ok(json!(verify::verify_content_quality(point)))
                    }
                    "category" => {
                        let Some(category) = arg_str(&args, "category") else {
                            return err("Error: action 'category' requires 'category'.".into());
                        };
                        let max_documents = args
                            .get("max_documents")
                            .and_then(Value::as_u64)
                            .map(|n| n as usize);
                        let doc_collection = self.ctx.config.collections.documentation.clone();
                        let code_collection = self.ctx.config.collections.code.clone();
                        let outcome = unwrap_or_fail!(verify::bulk_verify_category(
                            self.ctx.store.as_ref(),
                            &[doc_collection.as_str(), code_collection.as_str()],
                            category,
                            max_documents,
                        ));
                        ok(json!(outcome))
                    }
                    "audit" => {
                        let source_directory = arg_str(&args, "source_directory").map(PathBuf::from);
                        let recursive = arg_bool(&args, "recursive", true);
                        let extensions: Option<Vec<String>> = args
                            .get("extensions")
                            .and_then(Value::as_array)
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            });
                        let doc_collection = self.ctx.config.collections.documentation.clone();
                        let code_collection = self.ctx.config.collections.code.clone();
                        let report = unwrap_or_fail!(verify::audit_storage_integrity(
                            self.ctx.store.as_ref(),
                            &[doc_collection.as_str(), code_collection.as_str()],
                            source_directory.as_deref(),
                            recursive,
                            extensions.as_deref(),
                        ));
                        ok(json!(report))
                    }
                    other => err(format!(
                        "Error: invalid action for verify_documents: '{other}'. Choose one of: 'check', 'category', 'audit'."
                    )),
                }
            }

            "get_stats" => {
                let content_type = unwrap_or_fail!(Self::content_type(&args));
                let collection = self.ctx.collection_for(content_type).to_string();
                let filters = match args.get("filters") {
                    None | Some(Value::Null) => None,
                    Some(raw) => Some(unwrap_or_fail!(FilterNode::parse(raw))),
                };
                let group_by: Option<Vec<String>> = args
                    .get("group_by")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    });
                let stats = unwrap_or_fail!(query::aggregate(
                    self.ctx.store.as_ref(),
                    &collection,
                    filters.as_ref(),
                    group_by.as_deref(),
                ));

                let summarize = |collection: &str| match self.ctx.store.get_collection(collection) {
                    Ok(info) => json!({
                        "collection_name": collection,
                        "count": info.points_count,
                        "indexed_fields": info.payload_schema.keys().collect::<Vec<_>>(),
                    }),
                    Err(_) => json!({ "collection_name": collection, "count": 0 }),
                };
                ok(json!({
                    "status": "success",
                    "collections": {
                        "documentation": summarize(&self.ctx.config.collections.documentation),
                        "code": summarize(&self.ctx.config.collections.code),
                    },
                    "stats": stats,
                }))
            }

            _ => err(format!("Tool not found: {name}")),
        }
    }
}

pub fn run_stdio_server(ctx: PipelineContext) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut state = ServerState::new(ctx);

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // JSON-RPC notifications have no "id" field — don't respond.
        if msg.get("id").is_none() {
            continue;
        }

        let id = msg.get("id").cloned().unwrap_or(json!(null));
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "vectorloom", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                state.tool_call(id, &params)
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };

        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }

    Ok(())
}

const DEFAULT_MAX_CHARS: usize = 32_000;

fn negotiated_max_chars(args: &Value) -> usize {
    args.get("max_chars")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_CHARS)
}

/// Hard inline cap: always truncates in the response body. The truncation
/// marker makes partial output obvious to any client.
fn force_inline_truncate(mut content: String, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content;
    }
    let total_len = content.len();
    let mut cut = max_chars.min(content.len());
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content.truncate(cut);
    content.push_str(&format!("\n\n... [TRUNCATED: {max_chars}/{total_len} chars]"));
    content
}
