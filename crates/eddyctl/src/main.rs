//! eddyctl: Command-line interface for eddy stores.
//!
//! Runs one-shot statements, registers and searches patients, and watches
//! live queries from the terminal.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eddy::config::Config;
use eddy::{ConnectOptions, Connection, Connections, StoreHandle};

/// Command-line interface for eddy stores.
#[derive(Parser)]
#[command(name = "eddyctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {s}")),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one statement and print its rows
    Query {
        /// SQL text; parameters bind to $1, $2, ...
        sql: String,
        /// Parameter values (JSON literals; anything else is a string)
        params: Vec<String>,
    },
    /// Run statements that return no rows (DDL, batches)
    Exec {
        /// SQL text, possibly several statements
        sql: String,
    },
    /// Print a query's result, then again every time it changes
    Watch {
        /// SQL text; defaults to the patient list, newest first
        sql: Option<String>,
        /// Parameter values (JSON literals; anything else is a string)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Stop after this many updates (0 = until Ctrl+C)
        #[arg(short, long, default_value = "0")]
        count: u64,
    },
    /// Register a patient
    Register(commands::patients::RegisterArgs),
    /// Search patients by name or email
    Search {
        /// Case-insensitive substring
        term: String,
    },
    /// Interactive SQL console reading statements from stdin
    Console,
}

async fn connect(config: &Config) -> Result<Connection> {
    let store = StoreHandle::new(&config.data_dir, &config.store)
        .with_context(|| format!("invalid store '{}'", config.store))?;
    let connections = Connections::new(ConnectOptions::from(config));
    connections
        .get(&store)
        .await
        .with_context(|| format!("failed to open store {}", store.path().display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    eddy::observability::tracing::init_tracing(&cli.config.log_level, cli.config.log_json);
    eddy::observability::metrics::init_metrics_with_endpoint(cli.config.otel_endpoint.as_deref());

    let conn = connect(&cli.config).await?;
    tracing::debug!(delegate = %conn.delegate_id(), status = ?conn.leader_status(), "Connected");

    let outcome = match cli.command {
        Commands::Query { sql, params } => commands::sql::query(&conn, &sql, &params, cli.output).await,
        Commands::Exec { sql } => commands::sql::exec(&conn, &sql, cli.output).await,
        Commands::Watch { sql, params, count } => {
            let sql = sql.unwrap_or_else(|| eddy::patients::RECENT_PATIENTS_SQL.to_string());
            commands::watch::run(&conn, &sql, &params, count, cli.output).await
        }
        Commands::Register(args) => commands::patients::register(&conn, args, cli.output).await,
        Commands::Search { term } => commands::patients::search(&conn, &term, cli.output).await,
        Commands::Console => commands::console::run(&conn, cli.output).await,
    };

    conn.terminate().await;
    outcome
}
