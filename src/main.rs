//! # rag-backend CLI
//!
//! Runs the backend server and offers local, socket-free access to the same
//! handlers for operators.
//!
//! ## Usage
//!
//! ```bash
//! rag-backend --config ./config/rag-backend.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag-backend serve` | Listen on the configured Unix socket |
//! | `rag-backend reindex` | Run a reindex job in-process and report progress |
//! | `rag-backend sources` | Print the source catalog |
//! | `rag-backend sources add <location>` | Register a source as `pending_validation` |
//! | `rag-backend sources update <alias>` | Change a source's location, notes, language, or status |
//! | `rag-backend sources remove <alias> --reason <text>` | Quarantine a source |
//! | `rag-backend query "<question>"` | Answer a question from the local index |
//! | `rag-backend init` | Create state directories and verify the index |
//! | `rag-backend health` | Run health diagnostics |
//!
//! Log verbosity follows `RUST_LOG`, falling back to `[logging].filter`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rag_backend::config::{self, Config};
use rag_backend::progress::ProgressMode;
use rag_backend::reindex::ReindexRequest;
use rag_backend::router::{Route, RouteOutcome, Router};
use rag_backend::{server, sources};
use rag_backend_core::catalog::{SourceCreateRequest, SourceMutationResult, SourceUpdateRequest};
use rag_backend_core::models::{IngestionStatus, IngestionTrigger, SourceStatus, SourceType};
use serde_json::{json, Value};

/// Local knowledge-retrieval backend for CLI clients.
#[derive(Parser)]
#[command(name = "rag-backend", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// A missing file is an error; an empty file uses every default.
    #[arg(long, global = true, default_value = "./config/rag-backend.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve clients on the configured Unix socket until Ctrl-C.
    Serve,

    /// Reindex every active catalog source in this process.
    ///
    /// Unchanged sources are skipped unless `--force` is given. Progress is
    /// written to stderr; the final job is printed to stdout as JSON.
    Reindex {
        /// Recorded reason for the job: `init`, `manual`, or `scheduled`.
        #[arg(long, default_value = "manual")]
        trigger: IngestionTrigger,

        /// Re-ingest sources even when their checksum is unchanged.
        #[arg(long)]
        force: bool,

        /// Progress output (defaults to `human` on a terminal, else `off`).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print the source catalog, or change it with a subcommand.
    Sources {
        #[command(subcommand)]
        action: Option<SourcesAction>,
    },

    /// Answer a question from the local index.
    Query {
        question: String,

        /// Token budget for retrieved context.
        #[arg(long)]
        max_context_tokens: Option<u64>,
    },

    /// Create state directories and check that the index is usable.
    Init,

    /// Run health diagnostics and print the report.
    Health,
}

#[derive(Subcommand)]
enum SourcesAction {
    /// Register a source; it stays `pending_validation` until activated.
    Add {
        /// File or directory holding the source documents.
        location: String,

        /// `man`, `kiwix`, or `info`.
        #[arg(long = "type", default_value = "man")]
        source_type: SourceType,

        /// Alias to register; derived from the location when omitted.
        #[arg(long)]
        alias: Option<String>,

        /// ISO 639 language code.
        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Change fields of an existing source.
    Update {
        alias: String,

        #[arg(long)]
        location: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        #[arg(long)]
        language: Option<String>,

        /// `pending_validation`, `active`, `quarantined`, or `error`.
        #[arg(long)]
        status: Option<SourceStatus>,
    },

    /// Quarantine a source so the next reindex drops it.
    Remove {
        alias: String,

        /// Recorded in the audit log.
        #[arg(long)]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Reindex {
            trigger,
            force,
            progress,
        } => {
            let router = Arc::new(Router::from_config(&cfg)?);
            run_reindex(&router, trigger, force, progress.unwrap_or_else(ProgressMode::default_for_tty)).await?;
        }
        Commands::Sources { action } => {
            let router = Router::from_config(&cfg)?;
            match action {
                None => sources::list_sources(router.catalog().as_ref())?,
                Some(action) => run_sources_action(&router, action)?,
            }
        }
        Commands::Query {
            question,
            max_context_tokens,
        } => {
            let mut body = json!({ "question": question });
            if let Some(tokens) = max_context_tokens {
                body["max_context_tokens"] = json!(tokens);
            }
            print_response(&Router::from_config(&cfg)?, Route::Query, &body)?;
        }
        Commands::Init => print_response(&Router::from_config(&cfg)?, Route::AdminInit, &json!({}))?,
        Commands::Health => print_response(&Router::from_config(&cfg)?, Route::AdminHealth, &json!({}))?,
    }

    Ok(())
}

fn init_tracing(cfg: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_reindex(router: &Arc<Router>, trigger: IngestionTrigger, force: bool, mode: ProgressMode) -> Result<()> {
    let reporter = mode.reporter();
    let (initial, mut stream) = router.orchestrator().begin(ReindexRequest {
        trigger,
        force,
        resume_job_id: None,
    })?;

    let mut last = initial;
    while let Some(event) = stream.next().await {
        reporter.report(&event);
        last = event.job().clone();
    }

    println!("{}", serde_json::to_string_pretty(&last)?);
    if last.status != IngestionStatus::Succeeded {
        bail!(
            "reindex job {} {}: {}",
            last.job_id,
            last.status,
            last.error_message.as_deref().unwrap_or("no completion event received")
        );
    }
    Ok(())
}

fn run_sources_action(router: &Router, action: SourcesAction) -> Result<()> {
    let service = router.sources_admin();
    let result: SourceMutationResult = match action {
        SourcesAction::Add {
            location,
            source_type,
            alias,
            language,
            notes,
        } => service.create(&SourceCreateRequest {
            source_type: Some(source_type),
            location,
            alias,
            language,
            notes,
            trace_id: None,
        })?,
        SourcesAction::Update {
            alias,
            location,
            notes,
            language,
            status,
        } => service.update(
            &alias,
            &SourceUpdateRequest {
                location,
                notes,
                language,
                status,
                trace_id: None,
            },
        )?,
        SourcesAction::Remove { alias, reason } => service.remove(&alias, &reason, None)?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Dispatch locally and print the body; non-2xx statuses become errors.
fn print_response(router: &Router, route: Route, body: &Value) -> Result<()> {
    let (status, body) = match router.dispatch(route.path(), body) {
        RouteOutcome::Response { status, body } | RouteOutcome::Stream { status, body, .. } => (status, body),
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    if status >= 400 {
        bail!(
            "{} failed with {} {}",
            route.path(),
            status,
            body["code"].as_str().unwrap_or("UNKNOWN")
        );
    }
    Ok(())
}
