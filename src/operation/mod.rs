//! Health and readiness surface exposed by every long-running component.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

/// The health of a component or one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Health data for an individual dependency.
#[derive(Debug, Clone, Serialize)]
pub struct Dependency {
    /// The name of the component.
    pub name: String,
    /// The status of the component.
    pub status: HealthStatus,
    /// Any error message returned when checking the component's health.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A capability implemented by dependencies whose health can be checked.
#[async_trait]
pub trait Checker: Send + Sync {
    /// The name of the check, used as the dependency name in responses.
    fn name(&self) -> String;

    /// Returns an error if the component is deemed unhealthy.
    async fn check(&self) -> Result<()>;
}

/// Adapt any checker behind a shared pointer into a boxed dependency check.
///
/// Lets callers hand `Arc<dyn Bucket>` and friends to [`router`] without
/// relying on trait object upcasting.
pub fn checker<T: ?Sized + Checker + 'static>(inner: Arc<T>) -> Arc<dyn Checker> {
    struct Adapter<T: ?Sized>(Arc<T>);

    #[async_trait]
    impl<T: ?Sized + Checker> Checker for Adapter<T> {
        fn name(&self) -> String {
            self.0.name()
        }

        async fn check(&self) -> Result<()> {
            self.0.check().await
        }
    }

    Arc::new(Adapter(inner))
}

#[derive(Debug, Serialize)]
struct GetHealthResponse {
    status: HealthStatus,
    dependencies: Vec<Dependency>,
}

/// Returns a router serving `GET /api/health` and `GET /api/ready` for the
/// provided checks.
pub fn router(checks: Vec<Arc<dyn Checker>>) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/ready", get(get_readiness))
        .with_state(Arc::new(checks))
}

/// The top-level status is unhealthy if one or more dependencies report the
/// same, in which case the response code is 503.
async fn get_health(State(checks): State<Arc<Vec<Arc<dyn Checker>>>>) -> impl IntoResponse {
    let mut dependencies = Vec::with_capacity(checks.len());
    for check in checks.iter() {
        let dependency = match check.check().await {
            Ok(()) => Dependency {
                name: check.name(),
                status: HealthStatus::Healthy,
                message: None,
            },
            Err(err) => Dependency {
                name: check.name(),
                status: HealthStatus::Unhealthy,
                message: Some(err.to_string()),
            },
        };

        dependencies.push(dependency);
    }

    let status = if dependencies
        .iter()
        .all(|d| d.status == HealthStatus::Healthy)
    {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    let code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        code,
        Json(GetHealthResponse {
            status,
            dependencies,
        }),
    )
}

/// Readiness is implied by the ability to serve the request at all.
async fn get_readiness() -> StatusCode {
    StatusCode::OK
}
