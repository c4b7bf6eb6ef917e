use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use autopgo::cmd;

/// Continuous collection, merging and distribution of pprof profiles for
/// profile-guided optimization.
#[derive(Parser)]
#[command(name = "autopgo", about, version)]
struct Cli {
    /// Sets the minimum log level (debug, info, warn or error).
    #[arg(short = 'l', long, env = "AUTOPGO_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autopgo server.
    Server(cmd::server::ServerArgs),
    /// Run the autopgo worker.
    Worker(cmd::worker::WorkerArgs),
    /// Run the autopgo scraper.
    Scrape(cmd::scrape::ScrapeArgs),
    /// Run an example scraping target.
    Target(cmd::target::TargetArgs),
    /// Upload a profile.
    Upload(cmd::upload::UploadArgs),
    /// Download a profile.
    Download(cmd::download::DownloadArgs),
    /// List all profiles.
    List(cmd::list::ListArgs),
    /// Delete a profile.
    Delete(cmd::delete::DeleteArgs),
    /// Clean up profiles by age or size.
    Clean(cmd::clean::CleanArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    let cancel = CancellationToken::new();

    // Cancel the root token on SIGINT/SIGTERM; components observe it at
    // their next suspension point.
    let root = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        root.cancel();
    });

    match command {
        Command::Server(args) => cmd::server::run(args, cancel).await,
        Command::Worker(args) => cmd::worker::run(args, cancel).await,
        Command::Scrape(args) => cmd::scrape::run(args, cancel).await,
        Command::Target(args) => cmd::target::run(args, cancel).await,
        Command::Upload(args) => cmd::upload::run(args).await,
        Command::Download(args) => cmd::download::run(args).await,
        Command::List(args) => cmd::list::run(args).await,
        Command::Delete(args) => cmd::delete::run(args).await,
        Command::Clean(args) => cmd::clean::run(args).await,
    }
}
