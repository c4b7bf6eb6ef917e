//! The `target` subcommand: runs a demo application exposing a pprof
//! profile endpoint, useful for exercising the scraper end to end.

use std::time::Duration;

use anyhow::Result;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Args;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::pprof::ProfileBuilder;
use crate::server;

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Port to use for HTTP traffic.
    #[arg(short, long, env = "AUTOPGO_PORT", default_value_t = 8081)]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct ProfileQuery {
    seconds: Option<u64>,
}

pub async fn run(args: TargetArgs, cancel: CancellationToken) -> Result<()> {
    let router = Router::new().route("/debug/pprof/profile", get(profile));

    server::run(
        &cancel,
        server::Config {
            port: args.port,
            router,
        },
    )
    .await
}

/// Mimics the standard pprof endpoint: block for the requested number of
/// seconds, then return a small synthetic CPU profile covering them.
async fn profile(Query(query): Query<ProfileQuery>) -> impl IntoResponse {
    let seconds = query.seconds.unwrap_or(30);
    let duration = Duration::from_secs(seconds);

    tokio::time::sleep(duration).await;

    let profile = ProfileBuilder::new()
        .sample_type("samples", "count")
        .sample_type("cpu", "nanoseconds")
        .period("cpu", "nanoseconds", 10_000_000)
        .duration(duration)
        .sample(
            &["main.busyWork", "main.run", "main.main"],
            &[97, 970_000_000],
        )
        .sample(
            &["runtime.mallocgc", "main.run", "main.main"],
            &[3, 30_000_000],
        )
        .build();

    match profile.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "encoding demo profile");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}
