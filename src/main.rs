//! # notemesh CLI (`nmesh`)
//!
//! The `nmesh` binary is the local interface to a notemesh knowledge
//! base: database initialization, note ingestion, semantic search, sync
//! against the shared remote, and conflict resolution.
//!
//! ## Usage
//!
//! ```bash
//! nmesh --config ./notemesh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nmesh init` | Create the SQLite database and run schema migrations |
//! | `nmesh ingest <key>` | Chunk, embed, and index one note |
//! | `nmesh ingest --all` | Ingest every note in the tree |
//! | `nmesh search "<query>"` | Semantic search over indexed notes |
//! | `nmesh sync` | Reconcile with the remote store and re-index changes |
//! | `nmesh status` | Show sync phase, last report, pending conflicts |
//! | `nmesh resolve <key> <local\|remote>` | Resolve a sync conflict |
//! | `nmesh rebuild` | Rebuild the index partition from the notes tree |
//! | `nmesh stats` | Show index partition counts |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use notemesh::config::{load_config, Config};
use notemesh::embedding::create_embedder;
use notemesh::models::{ChosenVersion, SearchFilter};
use notemesh::remote::{DirRemote, RemoteStore};
use notemesh::KnowledgeBase;

/// notemesh — a semantic retrieval and sync engine for personal Markdown
/// knowledge bases.
#[derive(Parser)]
#[command(
    name = "nmesh",
    about = "notemesh — semantic retrieval and sync for personal knowledge bases",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./notemesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Chunk, embed, and index notes from the tree.
    Ingest {
        /// Note key (relative path under the notes root).
        key: Option<String>,

        /// Ingest every note in the tree.
        #[arg(long)]
        all: bool,
    },

    /// Semantic search over indexed notes.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict results to these note keys.
        #[arg(long)]
        key: Vec<String>,
    },

    /// Reconcile the notes tree with the remote store, then re-index
    /// whatever changed.
    Sync,

    /// Show sync phase, the last cycle's report, and pending conflicts.
    Status,

    /// Resolve a pending sync conflict by keeping one side.
    Resolve {
        key: String,

        /// Which version to keep: `local` or `remote`.
        version: String,
    },

    /// Drop and rebuild the index partition from the notes tree.
    Rebuild,

    /// Show index partition counts.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = notemesh::db::connect(&config.db.path).await?;
            notemesh::migrate::run_migrations(&pool).await?;
            println!("initialized {}", config.db.path.display());
            Ok(())
        }
        Commands::Ingest { key, all } => {
            let kb = open_kb(&config).await?;
            if all {
                let (docs, segments) = kb.ingest_all().await?;
                println!("ingest --all");
                println!("  documents: {docs}");
                println!("  segments written: {segments}");
            } else {
                let key = key.context("provide a note key or --all")?;
                let outcome = kb.ingest_document(&key).await?;
                println!("ingest {key}");
                println!("  segments written: {}", outcome.segments_written());
            }
            println!("ok");
            Ok(())
        }
        Commands::Search { query, top_k, key } => {
            let kb = open_kb(&config).await?;
            let filter = SearchFilter {
                document_keys: if key.is_empty() { None } else { Some(key) },
                tags: None,
            };
            let hits = kb.search(&query, top_k, &filter).await?;
            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for hit in hits {
                println!(
                    "{:.4}  {}#{}",
                    hit.score, hit.document_key, hit.segment_seq
                );
                println!("        {}", hit.snippet.replace('\n', " "));
            }
            Ok(())
        }
        Commands::Sync => {
            let kb = open_kb_with_remote(&config).await?;
            let report = kb.trigger_sync().await?;
            println!("sync {}", report.cycle_id);
            println!("  applied: {}", report.applied.len());
            println!("  deleted: {}", report.deleted.len());
            println!("  unchanged: {}", report.unchanged);
            if !report.failed.is_empty() {
                println!("  pending retry:");
                for failed in &report.failed {
                    println!("    {}: {}", failed.key, failed.error);
                }
            }
            if !report.conflicts.is_empty() {
                println!("  conflicts (resolve with `nmesh resolve <key> <local|remote>`):");
                for key in &report.conflicts {
                    println!("    {key}");
                }
            }
            println!("ok");
            Ok(())
        }
        Commands::Status => {
            let kb = open_kb(&config).await?;
            let status = kb.sync_status().await?;
            println!("phase: {:?}", status.phase);
            println!("pending conflicts: {}", status.pending_conflicts);
            for conflict in kb.pending_conflicts().await? {
                let sides = match (&conflict.local, &conflict.remote) {
                    (Some(_), Some(_)) => "edited on both sides",
                    (Some(_), None) => "edited locally, deleted remotely",
                    (None, Some(_)) => "deleted locally, edited remotely",
                    (None, None) => "unknown",
                };
                println!("  {}  ({sides})", conflict.key);
            }
            if let Some(report) = status.last_report {
                println!(
                    "last cycle: {} applied, {} deleted, {} failed",
                    report.applied.len(),
                    report.deleted.len(),
                    report.failed.len()
                );
            }
            Ok(())
        }
        Commands::Resolve { key, version } => {
            let chosen = match version.as_str() {
                "local" => ChosenVersion::Local,
                "remote" => ChosenVersion::Remote,
                other => bail!("unknown version '{other}', use local or remote"),
            };
            let kb = open_kb_with_remote(&config).await?;
            kb.resolve_conflict(&key, chosen).await?;
            println!("resolved {key} keeping {version}");
            Ok(())
        }
        Commands::Rebuild => {
            let kb = open_kb(&config).await?;
            let (docs, segments) = kb.rebuild_index().await?;
            println!("rebuild");
            println!("  documents: {docs}");
            println!("  segments written: {segments}");
            println!("ok");
            Ok(())
        }
        Commands::Stats => {
            let kb = open_kb(&config).await?;
            let stats = kb.stats().await?;
            println!("documents indexed: {}", stats.documents);
            println!("segments indexed: {}", stats.segments);
            Ok(())
        }
    }
}

/// Open the knowledge base for commands that never touch the remote.
async fn open_kb(config: &Config) -> Result<KnowledgeBase> {
    let remote: Arc<dyn RemoteStore> = match &config.sync.remote_root {
        Some(root) => Arc::new(DirRemote::new(root.clone())),
        None => Arc::new(notemesh::remote::MemoryRemote::new()),
    };
    open_with(config, remote).await
}

/// Open the knowledge base for sync-facing commands, which require a
/// configured remote.
async fn open_kb_with_remote(config: &Config) -> Result<KnowledgeBase> {
    let root = config
        .sync
        .remote_root
        .as_ref()
        .context("sync.remote_root must be configured for sync commands")?;
    open_with(config, Arc::new(DirRemote::new(root.clone()))).await
}

async fn open_with(config: &Config, remote: Arc<dyn RemoteStore>) -> Result<KnowledgeBase> {
    let embedder = create_embedder(&config.embedding)?;
    Ok(KnowledgeBase::open(config, Arc::from(embedder), remote).await?)
}
