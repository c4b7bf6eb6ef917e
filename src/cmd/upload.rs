//! The `upload` subcommand: uploads a profile file to the server.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio_util::io::ReaderStream;

use crate::client::Client;
use crate::profile::is_valid_app_name;

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// The profile file to upload.
    pub file: PathBuf,

    /// Base URL of the autopgo server.
    #[arg(short = 'u', long, env = "AUTOPGO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// The name of the application.
    #[arg(short, long, env = "AUTOPGO_APP")]
    pub app: String,
}

pub async fn run(args: UploadArgs) -> Result<()> {
    if !is_valid_app_name(&args.app) {
        bail!("{} is not a valid application name", args.app);
    }

    let file = match tokio::fs::File::open(&args.file).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("file {} does not exist", args.file.display());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("opening profile {}", args.file.display()));
        }
    };

    let client = Client::new(&args.api_url)?;
    client
        .upload(&args.app, reqwest::Body::wrap_stream(ReaderStream::new(file)))
        .await
        .context("uploading profile")?;

    Ok(())
}
