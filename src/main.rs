use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use vectorloom::backup;
use vectorloom::config::default_backup_dir;
use vectorloom::context::PipelineContext;
use vectorloom::query;
use vectorloom::server::run_stdio_server;
use vectorloom::verify;

#[derive(Debug, Parser)]
#[command(name = "vectorloom")]
#[command(version)]
#[command(about = "Content-addressed ingestion and incremental chunk indexing for external vector stores (Pure Rust MCP server)")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server
    Mcp,

    /// Create a local backup of the configured collections
    Backup {
        /// Backup root directory (default: ~/.vectorloom/backups)
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Include embedding vectors in the backup files
        #[arg(long)]
        include_embeddings: bool,

        /// Back up only the documentation collection
        #[arg(long)]
        skip_code: bool,
    },

    /// Restore a backup directory into the configured collections
    Restore {
        /// Path to one backup directory (backup_<collection>_<stamp>)
        path: PathBuf,

        /// Skip the post-restore verification sample
        #[arg(long)]
        no_verify: bool,

        /// Restore over existing point IDs instead of skipping them
        #[arg(long)]
        overwrite_existing: bool,
    },

    /// List local backups
    Backups {
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },

    /// Audit storage integrity, optionally against a source directory
    Audit {
        /// Source directory to compare the store against
        #[arg(long)]
        source_dir: Option<PathBuf>,

        /// Only audit files with these extensions (e.g. --extensions .md .txt)
        #[arg(long, num_args = 1..)]
        extensions: Option<Vec<String>>,

        /// Do not recurse into subdirectories
        #[arg(long)]
        non_recursive: bool,
    },

    /// Show collection statistics
    Stats,
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar.set_message(message.to_string());
    bar
}

fn initialize_context() -> Result<PipelineContext> {
    let bar = spinner("connecting to store and loading embedding models...");
    let ctx = PipelineContext::from_env().context("Failed to initialize pipeline")?;
    bar.finish_with_message("pipeline ready");
    Ok(ctx)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Mcp => {
            let ctx = PipelineContext::from_env().context("Failed to initialize pipeline")?;
            run_stdio_server(ctx)
        }

        Command::Backup {
            backup_dir,
            include_embeddings,
            skip_code,
        } => {
            let ctx = initialize_context()?;
            let backup_dir = backup_dir.unwrap_or_else(|| ctx.config.backup_dir.clone());
            let code_collection =
                (!skip_code).then(|| ctx.config.collections.code.clone());

            let bar = spinner("backing up collections...");
            let outcome = backup::create_backup(
                ctx.store.as_ref(),
                &ctx.config.collections.documentation,
                code_collection.as_deref(),
                &backup_dir,
                include_embeddings,
                None,
            )?;
            bar.finish_with_message(format!(
                "backed up {} documents to {}",
                outcome.document_count, outcome.backup_path
            ));
            print_json(&outcome)
        }

        Command::Restore {
            path,
            no_verify,
            overwrite_existing,
        } => {
            let ctx = initialize_context()?;
            let bar = spinner("verifying backup integrity and restoring...");
            let outcome = backup::restore_backup(
                ctx.store.as_ref(),
                &path,
                &ctx.config.collections.documentation,
                Some(&ctx.config.collections.code),
                !overwrite_existing,
                Some(ctx.doc_embedder.as_ref()),
                Some(ctx.code_embedder.as_ref()),
                !no_verify,
            )?;
            bar.finish_with_message(format!("restored {} documents", outcome.restored_count));
            print_json(&outcome)
        }

        Command::Backups { backup_dir } => {
            // Listing needs no store or models.
            let dir = backup_dir.unwrap_or_else(default_backup_dir);
            let listing = backup::list_backups(&dir)?;
            print_json(&listing)
        }

        Command::Audit {
            source_dir,
            extensions,
            non_recursive,
        } => {
            let ctx = initialize_context()?;
            let bar = spinner("auditing storage integrity...");
            let report = verify::audit_storage_integrity(
                ctx.store.as_ref(),
                &[
                    ctx.config.collections.documentation.as_str(),
                    ctx.config.collections.code.as_str(),
                ],
                source_dir.as_deref(),
                !non_recursive,
                extensions.as_deref(),
            )?;
            bar.finish_with_message(format!("integrity score: {}", report.integrity_score));
            print_json(&report)
        }

        Command::Stats => {
            let ctx = initialize_context()?;
            let stats = query::aggregate(
                ctx.store.as_ref(),
                &ctx.config.collections.documentation,
                None,
                None,
            )?;
            let doc_count = ctx
                .store
                .count(&ctx.config.collections.documentation)
                .unwrap_or(0);
            let code_count = ctx.store.count(&ctx.config.collections.code).unwrap_or(0);
            print_json(&serde_json::json!({
                "documentation": { "collection": ctx.config.collections.documentation, "count": doc_count },
                "code": { "collection": ctx.config.collections.code, "count": code_count },
                "stats": stats,
            }))
        }
    }
}
