//! The `server` subcommand: runs the profile intake HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::event::Writer;
use crate::metrics::{self, Metrics};
use crate::operation;
use crate::profile::ProfileController;
use crate::server;

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Port to use for HTTP traffic.
    #[arg(short, long, env = "AUTOPGO_PORT", default_value_t = 8080)]
    pub port: u16,

    /// The URL to use for writing to the event bus.
    #[arg(long, env = "AUTOPGO_EVENT_WRITER_URL")]
    pub event_writer_url: String,

    /// The URL to use for connecting to blob storage.
    #[arg(long, env = "AUTOPGO_BLOB_STORE_URL")]
    pub blob_store_url: String,
}

pub async fn run(args: ServerArgs, cancel: CancellationToken) -> Result<()> {
    let blobs = crate::blob::open_bucket(&args.blob_store_url)
        .await
        .context("opening blob store")?;

    let events = Arc::new(
        Writer::open(&args.event_writer_url)
            .await
            .context("opening event writer")?,
    );

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);

    let controller = ProfileController::new(
        Arc::clone(&blobs),
        Arc::clone(&events),
        Arc::clone(&metrics),
    );

    let router = controller
        .router()
        .merge(operation::router(vec![
            operation::checker(Arc::clone(&blobs)),
            operation::checker(Arc::clone(&events)),
        ]))
        .merge(metrics::router(metrics.registry().clone()));

    let result = server::run(
        &cancel,
        server::Config {
            port: args.port,
            router,
        },
    )
    .await;

    if let Err(e) = events.close().await {
        tracing::error!(error = %e, "error closing event writer");
    }

    result
}
