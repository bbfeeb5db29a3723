//! Conveyor CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Run delivery pipelines locally", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CONVEYOR_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
    },
    /// Run a pipeline once and wait for it to finish
    Run {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
        /// Repository the change came from
        #[arg(long)]
        repository: Option<String>,
        /// Branch to build
        #[arg(long)]
        branch: Option<String>,
        /// Commit to build
        #[arg(long)]
        commit: Option<String>,
    },
    /// Inspect past executions
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// List recent executions
    List {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
        /// Maximum number of executions to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show one execution, including failure diagnostics
    Show {
        /// Execution ID
        id: String,
        /// Path to the configuration file
        #[arg(long, default_value = "conveyor.kdl")]
        path: String,
        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate::validate(&path)?;
        }
        Commands::Run {
            path,
            repository,
            branch,
            commit,
        } => {
            let source = commands::run::SourceArgs {
                repository,
                branch,
                commit,
            };
            commands::run::run(&path, source).await?;
        }
        Commands::History { command } => match command {
            HistoryCommands::List { path, limit } => {
                commands::history::list(&path, limit).await?;
            }
            HistoryCommands::Show { id, path, json } => {
                commands::history::show(&path, &id, json).await?;
            }
        },
    }

    Ok(())
}
