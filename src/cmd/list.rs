//! The `list` subcommand: prints information on stored profiles.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;

use crate::client::Client;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Base URL of the autopgo server.
    #[arg(short = 'u', long, env = "AUTOPGO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,
}

pub async fn run(args: ListArgs) -> Result<()> {
    let client = Client::new(&args.api_url)?;
    let profiles = client.list().await.context("listing profiles")?;

    println!("{:<24}{:<12}LAST MODIFIED", "NAME", "SIZE");
    for profile in profiles {
        let age = (Utc::now() - profile.last_modified)
            .to_std()
            .unwrap_or_default();
        let age = std::time::Duration::from_secs(age.as_secs());

        println!(
            "{:<24}{:<12}{}",
            profile.key,
            profile.size,
            humantime::format_duration(age),
        );
    }

    Ok(())
}
