//! Prometheus metrics shared across components and served at `GET /metrics`.

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Operational counters for the server, worker and scraper. Each process
/// registers the full set and increments the ones relevant to it.
pub struct Metrics {
    registry: Registry,

    /// Total profiles accepted by the upload endpoint.
    pub profiles_uploaded: Counter,
    /// Total staged profiles merged into a base profile.
    pub profiles_merged: Counter,
    /// Total profiles scraped and forwarded to the server.
    pub profiles_scraped: Counter,
    /// Total per-target scrape failures.
    pub scrape_errors: Counter,
    /// Total events published to the bus.
    pub events_published: Counter,
    /// Total event handler failures in the worker.
    pub handler_errors: Counter,
    /// Number of targets returned by the last discovery listing.
    pub targets_discovered: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let profiles_uploaded = Counter::with_opts(
            Opts::new("profiles_uploaded_total", "Total profiles accepted by the upload endpoint.")
                .namespace("autopgo"),
        )?;
        let profiles_merged = Counter::with_opts(
            Opts::new("profiles_merged_total", "Total staged profiles merged into a base profile.")
                .namespace("autopgo"),
        )?;
        let profiles_scraped = Counter::with_opts(
            Opts::new("profiles_scraped_total", "Total profiles scraped and forwarded.")
                .namespace("autopgo"),
        )?;
        let scrape_errors = Counter::with_opts(
            Opts::new("scrape_errors_total", "Total per-target scrape failures.")
                .namespace("autopgo"),
        )?;
        let events_published = Counter::with_opts(
            Opts::new("events_published_total", "Total events published to the bus.")
                .namespace("autopgo"),
        )?;
        let handler_errors = Counter::with_opts(
            Opts::new("handler_errors_total", "Total event handler failures.")
                .namespace("autopgo"),
        )?;
        let targets_discovered = Gauge::with_opts(
            Opts::new("targets_discovered", "Targets returned by the last discovery listing.")
                .namespace("autopgo"),
        )?;

        registry.register(Box::new(profiles_uploaded.clone()))?;
        registry.register(Box::new(profiles_merged.clone()))?;
        registry.register(Box::new(profiles_scraped.clone()))?;
        registry.register(Box::new(scrape_errors.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(handler_errors.clone()))?;
        registry.register(Box::new(targets_discovered.clone()))?;

        Ok(Self {
            registry,
            profiles_uploaded,
            profiles_merged,
            profiles_scraped,
            scrape_errors,
            events_published,
            handler_errors,
            targets_discovered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Returns a router serving the registry in Prometheus text format.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(registry)
}

async fn serve_metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_registered() {
        let metrics = Metrics::new().expect("metrics should build");
        metrics.profiles_uploaded.inc();
        metrics.targets_discovered.set(3.0);

        let families = metrics.registry().gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"autopgo_profiles_uploaded_total"));
        assert!(names.contains(&"autopgo_targets_discovered"));
    }
}
