//! The `clean` subcommand: deletes profiles exceeding an age or size
//! threshold.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::blob::{Filter, Object};
use crate::client::Client;
use crate::profile::{is_larger_than, is_older_than};

#[derive(Debug, Args)]
pub struct CleanArgs {
    /// Base URL of the autopgo server.
    #[arg(short = 'u', long, env = "AUTOPGO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// The duration a profile must have remained static for.
    #[arg(short = 'd', long, env = "AUTOPGO_OLDER_THAN", value_parser = humantime::parse_duration)]
    pub older_than: Option<Duration>,

    /// The minimum size in bytes a profile must be.
    #[arg(short = 's', long, env = "AUTOPGO_LARGER_THAN")]
    pub larger_than: Option<u64>,
}

pub async fn run(args: CleanArgs) -> Result<()> {
    if args.older_than.is_none() && args.larger_than.is_none() {
        bail!("one of --older-than or --larger-than must be set");
    }

    let filter = Filter::any(
        [
            args.older_than.map(is_older_than),
            args.larger_than.map(is_larger_than),
        ]
        .into_iter()
        .flatten(),
    );

    let client = Client::new(&args.api_url)?;
    let profiles = client.list().await.context("listing profiles")?;

    for profile in profiles {
        let object = Object {
            key: profile.key.clone(),
            size: profile.size,
            last_modified: profile.last_modified,
        };

        if !filter.matches(&object) {
            continue;
        }

        client
            .delete(&profile.key)
            .await
            .with_context(|| format!("deleting profile for {}", profile.key))?;

        println!("Deleted profile '{}'", profile.key);
    }

    Ok(())
}
