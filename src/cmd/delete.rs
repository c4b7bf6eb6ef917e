//! The `delete` subcommand: removes an application's profiles.

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::client::Client;
use crate::profile::is_valid_app_name;

#[derive(Debug, Args)]
pub struct DeleteArgs {
    /// The name of the application.
    pub app: String,

    /// Base URL of the autopgo server.
    #[arg(short = 'u', long, env = "AUTOPGO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,
}

pub async fn run(args: DeleteArgs) -> Result<()> {
    if !is_valid_app_name(&args.app) {
        bail!("{} is not a valid application name", args.app);
    }

    let client = Client::new(&args.api_url)?;
    client
        .delete(&args.app)
        .await
        .with_context(|| format!("deleting profile for {}", args.app))?;

    Ok(())
}
