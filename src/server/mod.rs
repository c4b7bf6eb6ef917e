//! HTTP server skeleton shared by every component that exposes endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long in-flight requests get to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Configuration for running an HTTP server.
pub struct Config {
    /// The port to serve HTTP traffic on.
    pub port: u16,
    /// The routes to serve, typically several controllers merged together.
    pub router: Router,
}

/// Run an HTTP server until the cancellation token fires. Connections are
/// drained gracefully, with a hard stop after [`SHUTDOWN_GRACE`].
pub async fn run(cancel: &CancellationToken, config: Config) -> Result<()> {
    let app = config.router.layer(middleware::from_fn(log_requests));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("listening on port {}", config.port))?;

    let addr = listener.local_addr().context("getting local address")?;
    info!(addr = %addr, "http server started");

    let shutdown = cancel.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });

    tokio::select! {
        result = serve => result.context("serving http"),
        () = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            info!(addr = %addr, "http server shutdown grace period expired");
            Ok(())
        }
    }
}

async fn log_requests(request: Request, next: Next) -> Response {
    debug!(
        http.method = %request.method(),
        http.path = %request.uri().path(),
        "handling request",
    );

    next.run(request).await
}
