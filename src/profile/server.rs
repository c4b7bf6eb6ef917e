//! The HTTP controller for uploading, downloading, listing and deleting
//! application profiles.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::api::ApiError;
use crate::blob::{BlobError, Bucket};
use crate::event::Writer;
use crate::metrics::Metrics;
use crate::pprof::Profile;

use super::{
    base_profile_key, is_application, is_merged_profile, is_valid_app_name, ListResponse,
    StoredProfile, UploadResponse, UploadedEvent,
};

/// Serves the profile endpoints backed by blob storage, announcing uploads
/// on the event bus.
pub struct ProfileController {
    blobs: Arc<dyn Bucket>,
    events: Arc<Writer>,
    metrics: Arc<Metrics>,
}

struct ControllerState {
    blobs: Arc<dyn Bucket>,
    events: Arc<Writer>,
    metrics: Arc<Metrics>,
}

impl ProfileController {
    pub fn new(blobs: Arc<dyn Bucket>, events: Arc<Writer>, metrics: Arc<Metrics>) -> Self {
        Self {
            blobs,
            events,
            metrics,
        }
    }

    /// Build the controller's routes.
    pub fn router(self) -> Router {
        let state = Arc::new(ControllerState {
            blobs: self.blobs,
            events: self.events,
            metrics: self.metrics,
        });

        Router::new()
            .route("/api/profile", get(list))
            .route(
                "/api/profile/{app}",
                get(download).post(upload).delete(delete),
            )
            // Profiles can be large; the bucket is the backstop, not the
            // request body limit.
            .layer(DefaultBodyLimit::disable())
            .with_state(state)
    }
}

/// POST /api/profile/{app}
///
/// The body is parsed before anything durable happens, rejecting malformed
/// uploads early and normalizing the stored encoding. The uploaded event is
/// only published once the staged object is durably visible.
async fn upload(
    State(state): State<Arc<ControllerState>>,
    Path(app): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    if !is_valid_app_name(&app) {
        return Err(ApiError::bad_request("invalid app name"));
    }

    let profile = Profile::parse(&body).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let encoded = profile.encode().map_err(ApiError::internal)?;

    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .ok_or_else(|| ApiError::internal("timestamp out of range"))?;
    let key = format!("{app}/staging/{nanos}");

    let mut writer = state
        .blobs
        .open_writer(&key)
        .await
        .map_err(ApiError::internal)?;

    writer
        .write_all(&encoded)
        .await
        .map_err(ApiError::internal)?;

    writer.close().await.map_err(ApiError::internal)?;

    state
        .events
        .write(&UploadedEvent {
            app,
            profile_key: key.clone(),
        })
        .await
        .map_err(ApiError::internal)?;

    state.metrics.profiles_uploaded.inc();
    state.metrics.events_published.inc();

    Ok((StatusCode::CREATED, Json(UploadResponse { key })))
}

/// GET /api/profile/{app}
async fn download(
    State(state): State<Arc<ControllerState>>,
    Path(app): Path<String>,
) -> Result<Response, ApiError> {
    if !is_valid_app_name(&app) {
        return Err(ApiError::bad_request("invalid app name"));
    }

    let reader = match state.blobs.open_reader(&base_profile_key(&app)).await {
        Ok(reader) => reader,
        Err(BlobError::NotExist) => return Err(ApiError::not_found()),
        Err(e) => return Err(ApiError::internal(e)),
    };

    let body = Body::from_stream(ReaderStream::new(reader));

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

/// GET /api/profile
async fn list(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ListResponse>, ApiError> {
    let mut stream = state.blobs.list(is_merged_profile());
    let mut profiles = Vec::new();

    while let Some(item) = stream.next().await {
        let object = item.map_err(ApiError::internal)?;

        // Callers see the application name, not the default.pgo suffix.
        let key = object
            .key
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or(object.key);

        profiles.push(StoredProfile {
            key,
            size: object.size,
            last_modified: object.last_modified,
        });
    }

    Ok(Json(ListResponse { profiles }))
}

/// DELETE /api/profile/{app}
///
/// Removes the base profile and anything staged for the application. The
/// cascade to staged objects is intrinsic to the prefix iteration; no event
/// is emitted.
async fn delete(
    State(state): State<Arc<ControllerState>>,
    Path(app): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !is_valid_app_name(&app) {
        return Err(ApiError::bad_request("invalid app name"));
    }

    let exists = state
        .blobs
        .exists(&base_profile_key(&app))
        .await
        .map_err(ApiError::internal)?;

    if !exists {
        return Err(ApiError::not_found());
    }

    let mut stream = state.blobs.list(is_application(&app));
    while let Some(item) = stream.next().await {
        let object = item.map_err(ApiError::internal)?;

        match state.blobs.delete(&object.key).await {
            Ok(()) | Err(BlobError::NotExist) => {}
            Err(e) => return Err(ApiError::internal(e)),
        }
    }

    Ok(Json(serde_json::json!({})))
}
