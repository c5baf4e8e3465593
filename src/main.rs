//! # Tender Intake CLI (`tender`)
//!
//! ## Usage
//!
//! ```bash
//! tender --config ./config/tender.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tender init` | Create the SQLite database and schema |
//! | `tender scan` | Scan the source once and process what changed |
//! | `tender monitor` | Poll the source until Ctrl-C |
//! | `tender process <identity>` | Process one document now |
//! | `tender retry` | Retry failed documents whose backoff elapsed |
//! | `tender stats` | Pipeline statistics |
//! | `tender status <identity>` | Version lineage and audit trail |
//! | `tender report <reference>` | Tender summary |
//! | `tender query <reference> "<question>" [--answer]` | Most relevant chunks, optionally answered by the LLM |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tender_intake::{config, ingest, logging, migrate, report, search, stats};

/// Tender Intake: change-tracked ingestion of tender documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tender.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "tender", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tender.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    #[command(alias = "setup")]
    Init,

    /// Scan the source once, process new and changed documents, and wait
    /// for the runs to finish.
    Scan,

    /// Scan on a fixed interval until Ctrl-C. In-flight documents stop at
    /// the next stage boundary.
    Monitor,

    /// Process a single document by identity (its path under the source root).
    Process {
        identity: String,

        /// Reset a failed or exhausted document before processing.
        #[arg(long)]
        force: bool,
    },

    /// Retry failed documents whose backoff window has elapsed.
    Retry,

    /// Show pipeline statistics.
    Stats,

    /// Show the versions and audit trail of one document.
    Status { identity: String },

    /// Print a tender summary with criteria and required documents.
    Report { reference: String },

    /// Retrieve the chunks of a tender most relevant to a question.
    Query {
        reference: String,
        question: String,

        /// Number of chunks to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Answer the question with the extraction model over the retrieved chunks.
        #[arg(long)]
        answer: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    logging::init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scan => ingest::run_scan(&cfg).await?,
        Commands::Monitor => ingest::run_monitor(&cfg).await?,
        Commands::Process { identity, force } => {
            ingest::run_process(&cfg, &identity, force).await?
        }
        Commands::Retry => ingest::run_retry(&cfg).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Status { identity } => stats::run_status(&cfg, &identity).await?,
        Commands::Report { reference } => report::run_report(&cfg, &reference).await?,
        Commands::Query {
            reference,
            question,
            limit,
            answer,
        } => search::run_query(&cfg, &reference, &question, limit, answer).await?,
    }

    Ok(())
}
