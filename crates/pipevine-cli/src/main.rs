mod commands;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use pipevine_state::{FileStateStore, SqliteStateStore, StateStore};

#[derive(Parser)]
#[command(name = "pipevine", version, about = "DAG pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Shortcut for --log-level debug
    #[arg(long, global = true)]
    verbose: bool,

    /// Shortcut for --log-level error
    #[arg(long, global = true)]
    silent: bool,

    /// Emit logs as newline-delimited JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// SQLite state database path
    #[arg(long, default_value = ".pipevine/state.db", global = true)]
    state: PathBuf,

    /// Use the single-file JSON state backend at this path instead of SQLite
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and execute a pipeline
    Run {
        /// Path to the pipeline configuration (JSON or YAML)
        config: PathBuf,
        /// Execute even when validation reported errors
        #[arg(long)]
        force: bool,
        /// Emit a machine-readable JSON result
        #[arg(long)]
        json: bool,
        /// Write the run record to a file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Path to the pipeline configuration (JSON or YAML)
        config: PathBuf,
        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,
        /// Emit a machine-readable JSON report
        #[arg(long)]
        json: bool,
    },
    /// Emit a Mermaid diagram of the task graph
    Visualize {
        /// Path to the pipeline configuration (JSON or YAML)
        config: PathBuf,
        /// Write the diagram to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Register the pipeline's cron triggers and optionally keep firing
    Schedule {
        /// Path to the pipeline configuration (JSON or YAML)
        config: PathBuf,
        /// Stay in the foreground and fire triggers until interrupted
        #[arg(long)]
        daemon: bool,
    },
}

impl Cli {
    fn open_store(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        Ok(match &self.state_file {
            Some(path) => Arc::new(FileStateStore::open(path)?),
            None => Arc::new(SqliteStateStore::open(&self.state)?),
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.silent {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };
    logging::init(level, cli.log_json);

    let outcome = dispatch(&cli).await;
    if let Err(e) = outcome {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Run {
            config,
            force,
            json,
            output,
        } => {
            let store = cli.open_store()?;
            commands::run::execute(config, *force, *json, output.as_deref(), store).await
        }
        Commands::Validate {
            config,
            strict,
            json,
        } => commands::validate::execute(config, *strict, *json),
        Commands::Visualize { config, output } => {
            commands::visualize::execute(config, output.as_deref())
        }
        Commands::Schedule { config, daemon } => {
            let store = cli.open_store()?;
            commands::schedule::execute(config, *daemon, store).await
        }
    }
}
