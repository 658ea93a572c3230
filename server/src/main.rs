use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tally_server::{config::ServerConfig, migrate, serve, submit};

#[derive(Parser, Debug)]
#[command(name = "tally-server")]
#[command(about = "Durable character-count job queue service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API, worker pool, and reaper.
    Serve,

    /// Run store migrations and exit.
    Migrate,

    /// Submit a UTF-8 text file directly through the core.
    Submit {
        /// Path of the file to submit.
        path: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = ServerConfig::from_env().context("load server config")?;

    match cli.command {
        Command::Serve => serve::run(&cfg).await,
        Command::Migrate => migrate::run(&cfg).await,
        Command::Submit { path } => submit::run(&cfg, &path).await,
    }
}
