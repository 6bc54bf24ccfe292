use crate::config::{ApiConfig, StorageConfig};
use crate::naming::{create_unique, extension_of, NamingCandidate};
use crate::stage::{PhotoRef, PhotoSink};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

const APP_NAME: &str = "photopi-api";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Where accepted uploads are handed off
    pub pipeline: Arc<dyn PhotoSink>,
    pub photos_path: PathBuf,
    pub upload_tag: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Healthcheck {
    pub app_name: String,
    pub version: String,
}

#[derive(Debug, Default, Serialize)]
pub struct UploadResponse {
    pub message: String,
    /// Client-side names of the files in the request
    pub files: Vec<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, storage: &StorageConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/photos", post(add_photos))
        .nest_service("/ui", ServeDir::new(&storage.ui_path))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(Healthcheck {
        app_name: APP_NAME.to_string(),
        version: state.version.clone(),
    })
}

/// Accept one or more photos and send them down the pipeline.
///
/// Only parts named after the configured upload tag are stored; the rest are
/// skipped. Every stored photo gets its own `Location` header.
#[instrument(skip_all)]
async fn add_photos(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    mut multipart: Multipart,
) -> Response {
    let mut result = UploadResponse::default();
    let mut locations = HeaderMap::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read multipart body");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error reading part {}", e),
                )
                    .into_response();
            }
        };

        if field.name() != Some(state.upload_tag.as_str()) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        info!(file = %file_name, "Uploaded file");
        result.files.push(file_name.clone());

        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => {
                result.message = format!("Error reading photo {}: {}", file_name, e);
                return upload_failed(result);
            }
        };

        let stored = match store_upload(&state.photos_path, &file_name, &data).await {
            Ok(path) => path,
            Err(e) => {
                result.message = format!("Error saving photo {}: {:#}", file_name, e);
                return upload_failed(result);
            }
        };

        if let Err(e) = state.pipeline.submit(PhotoRef::new(&stored)).await {
            result.message = format!("Error queueing photo {}: {}", file_name, e);
            return upload_failed(result);
        }

        if let Some(location) = location_for(&stored, &headers, &uri) {
            locations.append(header::LOCATION, location);
        }
    }

    result.message = "Successfully uploaded files".to_string();
    (StatusCode::OK, locations, Json(result)).into_response()
}

fn upload_failed(result: UploadResponse) -> Response {
    error!(reason = %result.message, "Photo upload failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(result)).into_response()
}

/// Name an upload from its metadata and write it under a fresh name in `dir`.
pub async fn store_upload(dir: &Path, file_name: &str, data: &[u8]) -> Result<PathBuf> {
    let candidate = NamingCandidate::for_image(data, extension_of(file_name));

    let path = create_unique(dir, &candidate, data)
        .await
        .with_context(|| {
            format!(
                "Failed to write {} into {}",
                candidate.file_name(0),
                dir.display()
            )
        })?;

    metrics::counter!("photos.uploads.stored").increment(1);
    info!(path = %path.display(), size_bytes = data.len(), "Stored upload");

    Ok(path)
}

fn location_for(stored: &Path, headers: &HeaderMap, uri: &Uri) -> Option<HeaderValue> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let name = stored.file_name()?.to_string_lossy();
    let url = format!("http://{}{}/{}", host, uri.path().trim_end_matches('/'), name);

    HeaderValue::from_str(&url).ok()
}

/// Serve the API until `shutdown` resolves.
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    storage: &StorageConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config, storage);
    let addr = config.listen_addr()?;

    info!(address = %addr, "Starting photos API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
