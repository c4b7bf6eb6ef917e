//! The `scrape` subcommand: runs the scraper alongside a local health
//! server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::metrics::{self, Metrics};
use crate::operation;
use crate::profile::{ScrapeConfig, Scraper};
use crate::server;
use crate::target;

#[derive(Debug, Args)]
pub struct ScrapeArgs {
    /// Location of the scrape configuration file.
    pub config: PathBuf,

    /// Base URL of the autopgo server.
    #[arg(short = 'u', long, env = "AUTOPGO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// The discovery source to list scrape targets from. One of
    /// file://<path>, kubernetes://, nomad://<host:port> or
    /// consul://<host:port>.
    #[arg(long, env = "AUTOPGO_SOURCE")]
    pub source: String,

    /// Port to use for HTTP traffic.
    #[arg(short, long, env = "AUTOPGO_PORT", default_value_t = 8082)]
    pub port: u16,
}

pub async fn run(args: ScrapeArgs, cancel: CancellationToken) -> Result<()> {
    let data = tokio::fs::read(&args.config)
        .await
        .with_context(|| format!("reading scrape config {}", args.config.display()))?;

    let config: ScrapeConfig = serde_json::from_slice(&data)
        .with_context(|| format!("parsing scrape config {}", args.config.display()))?;
    config.validate().context("validating scrape config")?;

    let client = Arc::new(Client::new(&args.api_url).context("creating client")?);
    let source = target::open_source(&args.source, &config.app, &cancel)
        .await
        .context("opening target source")?;

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);

    let scraper = Scraper::new(
        Arc::clone(&client) as _,
        Arc::clone(&source),
        config,
        Arc::clone(&metrics),
    );

    let router = operation::router(vec![
        operation::checker(Arc::clone(&source)),
        operation::checker(Arc::clone(&client)),
    ])
    .merge(metrics::router(metrics.registry().clone()));

    tokio::try_join!(
        scraper.run(&cancel),
        server::run(
            &cancel,
            server::Config {
                port: args.port,
                router,
            },
        ),
    )
    .map(|_| ())
}
