//! The `download` subcommand: downloads an application's merged profile.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::client::Client;
use crate::profile::is_valid_app_name;

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// The name of the application.
    pub app: String,

    /// Base URL of the autopgo server.
    #[arg(short = 'u', long, env = "AUTOPGO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Where to place the downloaded profile on the local filesystem.
    #[arg(short, long, env = "AUTOPGO_OUTPUT", default_value = "default.pgo")]
    pub output: PathBuf,
}

pub async fn run(args: DownloadArgs) -> Result<()> {
    if !is_valid_app_name(&args.app) {
        bail!("{} is not a valid application name", args.app);
    }

    let mut file = tokio::fs::File::create(&args.output)
        .await
        .with_context(|| format!("creating {}", args.output.display()))?;

    let client = Client::new(&args.api_url)?;
    client
        .download(&args.app, &mut file)
        .await
        .context("downloading profile")?;

    Ok(())
}
