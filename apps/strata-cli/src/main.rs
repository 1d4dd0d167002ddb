//! # strata: Snapshot Sync Job Runner
//!
//! Command-line entry point for pulling tables from external services into
//! local snapshots, editing them, and pushing the edits back.
//!
//! ## Commands
//!
//! - `config init|show` - Write or print `strata.toml`
//! - `connections` - List configured connections
//! - `tables` - Discover tables on a connection
//! - `pull` - Pull tables into a snapshot (resumes after failures)
//! - `push` - Push dirty rows back to the service
//! - `list` / `get` - Read snapshot records
//! - `edit` / `accept` / `reject` - Local edits and suggestion review
//! - `status` - Dirty counts, suggestions and pull checkpoints
//! - `snapshots` / `drop` - Snapshot housekeeping
//!
//! ## Logging
//! `RUST_LOG` wins; otherwise `info,strata=debug,sqlx=warn`, or `debug`
//! everywhere with `--verbose`.

mod commands;
mod error;
mod retry;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::PushOperation;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::commands::Context;

/// Snapshot sync for external data services.
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to strata.toml (defaults to the platform config directory)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(global = true, long)]
    json: bool,

    /// Enable debug logging for every crate
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List configured connections
    Connections,

    /// Discover tables on a connection
    Tables {
        /// Connection name from [connections.<name>]
        connection: String,

        /// Filter by display name
        #[arg(short, long)]
        search: Option<String>,

        /// Continue a previous search page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Pull tables into a snapshot
    Pull {
        /// Connection name from [connections.<name>]
        connection: String,

        /// Tables to pull (wsId, remote id or display name)
        #[arg(required = true)]
        tables: Vec<String>,

        /// Snapshot id (defaults to the connection name)
        #[arg(short, long)]
        snapshot: Option<String>,

        /// Ignore any incomplete checkpoint and start over
        #[arg(long)]
        restart: bool,

        /// Start from this connector progress token (JSON)
        #[arg(long, conflicts_with = "restart")]
        resume_token: Option<String>,
    },

    /// Push dirty rows back to the service
    Push {
        /// Connection name from [connections.<name>]
        connection: String,

        /// Tables to push (defaults to every table in the snapshot)
        tables: Vec<String>,

        /// Snapshot id (defaults to the connection name)
        #[arg(short, long)]
        snapshot: Option<String>,

        /// Only run one push path (create, update, delete)
        #[arg(short, long)]
        operation: Option<PushOperation>,
    },

    /// List records of a snapshot table
    List {
        snapshot: String,
        table: String,

        /// wsId of the last record of the previous page
        #[arg(long)]
        cursor: Option<String>,

        /// Page size
        #[arg(short, long, default_value_t = strata_core::DEFAULT_LIST_LIMIT)]
        limit: u32,

        /// Filter predicate as JSON, or @file
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Show one record
    Get {
        snapshot: String,
        table: String,
        ws_id: String,
    },

    /// Apply edit operations (JSON array, or @file)
    Edit {
        snapshot: String,
        table: String,
        ops: String,

        /// Store the values as suggestions instead of applying them
        #[arg(long)]
        suggest: bool,
    },

    /// Accept suggested values
    Accept {
        snapshot: String,
        table: String,

        /// Fields to accept as wsId:fieldId
        refs: Vec<String>,

        /// Accept every pending suggestion in the table
        #[arg(long, conflicts_with = "refs")]
        all: bool,
    },

    /// Reject suggested values
    Reject {
        snapshot: String,
        table: String,

        /// Fields to reject as wsId:fieldId
        refs: Vec<String>,

        /// Reject every pending suggestion in the table
        #[arg(long, conflicts_with = "refs")]
        all: bool,
    },

    /// Dirty counts, pending suggestions and pull checkpoints
    Status {
        snapshot: String,

        /// Limit to one table
        table: Option<String>,
    },

    /// List snapshots in the store
    Snapshots,

    /// Drop a snapshot and all of its tables
    Drop { snapshot: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration (API keys masked)
    Show,
}

/// Initializes the tracing subscriber.
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info,strata=debug,sqlx=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "strata starting");

    let json = cli.json;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                match serde_json::to_string(&e) {
                    Ok(body) => eprintln!("{}", body),
                    Err(_) => eprintln!("{}", e),
                }
            } else {
                eprintln!("{}", e);
            }
            ExitCode::from(e.code.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), error::CliError> {
    // `config init` must work before a valid config exists.
    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        return commands::config::init(cli.config.clone(), *force);
    }

    let ctx = Context::load(cli.config.clone(), cli.json)?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { .. } => Ok(()),
            ConfigAction::Show => commands::config::show(&ctx),
        },
        Commands::Connections => commands::config::connections(&ctx),
        Commands::Tables {
            connection,
            search,
            cursor,
        } => commands::tables::run(&ctx, &connection, search.as_deref(), cursor.as_deref()).await,
        Commands::Pull {
            connection,
            tables,
            snapshot,
            restart,
            resume_token,
        } => {
            let snapshot = snapshot.unwrap_or_else(|| connection.clone());
            let options = commands::pull::PullOptions {
                restart,
                resume_token,
            };
            commands::pull::run(&ctx, &connection, &snapshot, &tables, options).await
        }
        Commands::Push {
            connection,
            tables,
            snapshot,
            operation,
        } => {
            let snapshot = snapshot.unwrap_or_else(|| connection.clone());
            commands::push::run(&ctx, &connection, &snapshot, &tables, operation).await
        }
        Commands::List {
            snapshot,
            table,
            cursor,
            limit,
            filter,
        } => commands::records::list(&ctx, &snapshot, &table, cursor, limit, filter.as_deref()).await,
        Commands::Get {
            snapshot,
            table,
            ws_id,
        } => commands::records::get(&ctx, &snapshot, &table, &ws_id).await,
        Commands::Edit {
            snapshot,
            table,
            ops,
            suggest,
        } => commands::records::edit(&ctx, &snapshot, &table, &ops, suggest).await,
        Commands::Accept {
            snapshot,
            table,
            refs,
            all,
        } => commands::records::resolve(&ctx, &snapshot, &table, &refs, all, true).await,
        Commands::Reject {
            snapshot,
            table,
            refs,
            all,
        } => commands::records::resolve(&ctx, &snapshot, &table, &refs, all, false).await,
        Commands::Status { snapshot, table } => {
            commands::records::status(&ctx, &snapshot, table.as_deref()).await
        }
        Commands::Snapshots => commands::records::snapshots(&ctx).await,
        Commands::Drop { snapshot } => commands::records::drop(&ctx, &snapshot).await,
    }
}
