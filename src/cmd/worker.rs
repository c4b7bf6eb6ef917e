//! The `worker` subcommand: runs the merge worker alongside its health
//! server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event::{Reader, Writer};
use crate::metrics::{self, Metrics};
use crate::operation;
use crate::profile::{load_prune_config, Worker};
use crate::server;

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Port to use for HTTP traffic.
    #[arg(short, long, env = "AUTOPGO_PORT", default_value_t = 8081)]
    pub port: u16,

    /// The URL to use for reading from the event bus.
    #[arg(long, env = "AUTOPGO_EVENT_READER_URL")]
    pub event_reader_url: String,

    /// The URL to use for writing to the event bus.
    #[arg(long, env = "AUTOPGO_EVENT_WRITER_URL")]
    pub event_writer_url: String,

    /// The URL to use for connecting to blob storage.
    #[arg(long, env = "AUTOPGO_BLOB_STORE_URL")]
    pub blob_store_url: String,

    /// Location of the configuration file for profile pruning.
    #[arg(long, env = "AUTOPGO_PRUNE")]
    pub prune: Option<PathBuf>,
}

pub async fn run(args: WorkerArgs, cancel: CancellationToken) -> Result<()> {
    let blobs = crate::blob::open_bucket(&args.blob_store_url)
        .await
        .context("opening blob store")?;

    let reader = Arc::new(
        Reader::open(&args.event_reader_url)
            .await
            .context("opening event reader")?,
    );

    let writer = Arc::new(
        Writer::open(&args.event_writer_url)
            .await
            .context("opening event writer")?,
    );

    let pruning = load_prune_config(args.prune.as_deref())?;
    if pruning.is_empty() {
        warn!("worker starting with no prune rules");
    }

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);

    let worker = Worker::new(
        Arc::clone(&blobs),
        Arc::clone(&writer),
        pruning,
        Arc::clone(&metrics),
    );

    let router = operation::router(vec![
        operation::checker(Arc::clone(&blobs)),
        operation::checker(Arc::clone(&reader)),
        operation::checker(Arc::clone(&writer)),
    ])
    .merge(metrics::router(metrics.registry().clone()));

    let event_types = Worker::event_types();
    let result = tokio::try_join!(
        reader.read(&cancel, &event_types, &worker),
        server::run(
            &cancel,
            server::Config {
                port: args.port,
                router,
            },
        ),
    )
    .map(|_| ());

    if let Err(e) = reader.close().await {
        tracing::error!(error = %e, "error closing event reader");
    }

    if let Err(e) = writer.close().await {
        tracing::error!(error = %e, "error closing event writer");
    }

    result
}
