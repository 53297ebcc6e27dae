mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rhizome::config::{self, RhizomeConfig};

#[derive(Parser)]
#[command(name = "rhizome", version, about = "Persistent memory engine for AI agents")]
struct Cli {
    /// Config file (default: ~/.rhizome/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the database and probe every AI capability
    Doctor,
    /// Search stored memories
    Search(cli::search::SearchArgs),
    /// Show memory counts, recent sessions, and domains
    Stats {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RhizomeConfig::load_from(path)?,
        None => RhizomeConfig::load_from(config::default_config_path())?,
    };

    // Logs go to stderr so command output on stdout stays pipeable.
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Doctor => cli::doctor::doctor(&config).await?,
        Command::Search(args) => cli::search::search(&config, args).await?,
        Command::Stats { json } => cli::stats(&config, json).await?,
    }

    Ok(())
}
