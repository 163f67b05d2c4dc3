//! # Project Ingest CLI (`ingest`)
//!
//! Command-line front end for the ingestion pipeline: upload archives,
//! browse committed projects, and manage file annotations.
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the SQLite database and run schema migrations |
//! | `ingest upload <zip>...` | Ingest one or more archives |
//! | `ingest projects` | List registered projects |
//! | `ingest tree <project>` | Show a project's file tree |
//! | `ingest cat <project> <path>` | Print a committed file |
//! | `ingest verify <project>` | Re-hash storage and compare with the registry |
//! | `ingest delete <project>` | Remove a project everywhere |
//! | `ingest describe <project> [path]` | Show or set annotations |
//!
//! Results go to stdout (JSON where structured); logs go to stderr and are
//! filtered by `RUST_LOG` (default `info`).

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use project_ingest::annotations::SqliteAnnotationStore;
use project_ingest::archive::ExtractOptions;
use project_ingest::config::{self, Config};
use project_ingest::ingest::Ingestor;
use project_ingest::registry::SqliteProjectRegistry;
use project_ingest::{db, migrate, storage};

/// Project Ingest CLI: upload project archives and browse what was stored.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Project Ingest: archive ingestion with change detection and annotation carry-over",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest one or more `.zip` archives.
    ///
    /// The project name is the archive's file name without `.zip`. An
    /// archive whose content matches the registered hash is reported as
    /// already uploaded and nothing is written.
    Upload {
        /// Archive files to upload, processed in order.
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// List registered projects.
    Projects,

    /// Show the file tree of a committed project.
    Tree {
        project: String,

        /// Print nested JSON instead of an indented listing.
        #[arg(long)]
        json: bool,
    },

    /// Print a file from a committed project.
    Cat { project: String, path: String },

    /// Re-hash the stored tree and compare it with the registry.
    Verify { project: String },

    /// Remove a project from storage, the registry, and the annotation store.
    Delete { project: String },

    /// Show or set annotations.
    ///
    /// Without a path, lists every annotation of the project. With a path
    /// (use "" for the project itself), shows that annotation, or replaces
    /// it when `--set` is given. `--set ""` clears it.
    Describe {
        project: String,
        path: Option<String>,

        #[arg(long)]
        set: Option<String>,
    },
}

async fn build_ingestor(cfg: &Config) -> Result<Ingestor> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool)
        .await
        .context("Failed to apply database migrations")?;

    let backend = storage::build_backend(cfg).await?;
    Ok(Ingestor::new(
        backend,
        Arc::new(SqliteProjectRegistry::new(pool.clone())),
        Arc::new(SqliteAnnotationStore::new(pool)),
        ExtractOptions {
            max_entry_bytes: cfg.ingest.max_entry_bytes,
        },
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Upload { archives } => {
            let ingestor = build_ingestor(&cfg).await?;
            let mut failed = 0usize;
            for path in &archives {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .with_context(|| format!("Not a file path: {}", path.display()))?;
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read archive: {}", path.display()))?;

                match ingestor.upload(&file_name, bytes).await {
                    Ok(outcome) => print_json(&outcome)?,
                    Err(e) if e.is_archive_fault() => {
                        failed += 1;
                        tracing::error!(archive = %path.display(), error = %e, "archive rejected");
                    }
                    Err(e) => {
                        failed += 1;
                        tracing::error!(archive = %path.display(), error = %e, "upload failed");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} uploads failed", failed, archives.len());
            }
        }
        Commands::Projects => {
            let ingestor = build_ingestor(&cfg).await?;
            print_json(&ingestor.list_projects().await?)?;
        }
        Commands::Tree { project, json } => {
            let ingestor = build_ingestor(&cfg).await?;
            let tree = ingestor.tree(&project).await?;
            if json {
                print_json(&tree.to_json())?;
            } else {
                print!("{}", tree.render());
            }
        }
        Commands::Cat { project, path } => {
            let ingestor = build_ingestor(&cfg).await?;
            let bytes = ingestor.read_file(&project, &path).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
        Commands::Verify { project } => {
            let ingestor = build_ingestor(&cfg).await?;
            print_json(&ingestor.verify_project(&project).await?)?;
        }
        Commands::Delete { project } => {
            let ingestor = build_ingestor(&cfg).await?;
            if ingestor.delete_project(&project).await? {
                println!("Deleted project '{}'.", project);
            } else {
                println!("No project named '{}'.", project);
            }
        }
        Commands::Describe { project, path, set } => {
            let ingestor = build_ingestor(&cfg).await?;
            match (path, set) {
                (None, None) => print_json(&ingestor.annotations(&project).await?)?,
                (None, Some(_)) => anyhow::bail!("--set requires a path (use \"\" for the project)"),
                (Some(path), Some(text)) => {
                    ingestor.annotate(&project, &path, &text).await?;
                    println!("Saved.");
                }
                (Some(path), None) => match ingestor.annotation(&project, &path).await? {
                    Some(text) => println!("{}", text),
                    None => println!("(no description)"),
                },
            }
        }
    }

    Ok(())
}
