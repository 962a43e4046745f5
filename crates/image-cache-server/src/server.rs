//! HTTP server for the image cache
//!
//! Provides /health, /image, /variant, /prefetch and the cache management
//! endpoints under /cache and /config.

use crate::types::{
    CacheSizeResponse, HealthResponse, ImageQuery, PrefetchRequest, PrefetchResponse,
    SetCacheSizeRequest, SetCacheSizeResponse, VariantQuery, VariantSettingsRequest,
    VariantSettingsResponse,
};
use axum::{
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use image_cache::{CacheError, CacheProvider, ImageSource, VariantResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: CacheProvider,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: CacheProvider) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// A failed request, rendered as JSON with a matching status
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        let status = match &err {
            CacheError::Transport(_) | CacheError::Decode(_) => StatusCode::BAD_GATEWAY,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::VariantsDisabled => StatusCode::CONFLICT,
            CacheError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            CacheError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image))
        .route("/variant", get(get_variant))
        .route("/prefetch", post(prefetch))
        .route("/cache", delete(clear_cache))
        .route("/cache/memory", delete(clear_memory_cache))
        .route("/cache/size", get(cache_size).put(set_cache_size))
        .route("/config/variants", put(set_variant_settings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache_stats = state.cache.stats().await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to collect cache stats");
        Default::default()
    });
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache_stats,
    })
}

/// Serve an original image
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<Response> {
    let loaded = state
        .cache
        .request_image(&query.url)?
        .wait()
        .await
        .inspect_err(|e| warn!(url = %query.url, error = %e, "Failed to load image"))?;

    let cache_header = match loaded.source {
        ImageSource::Memory => "MEMORY",
        ImageSource::Disk => "DISK",
        ImageSource::Network => "MISS",
    };

    blob_response(&loaded.path, cache_header).await
}

/// Serve a rounded variant, waiting for it to render if needed
async fn get_variant(
    State(state): State<SharedState>,
    Query(query): Query<VariantQuery>,
) -> ApiResult<Response> {
    let spec = state
        .cache
        .default_variant()
        .with_overrides(query.radius, query.width, query.height);

    let (ready, cache_header) = match state.cache.request_variant(&query.url, Some(spec)).await? {
        VariantResult::Ready(ready) => (ready, "HIT"),
        VariantResult::Scheduled(request) => {
            let ready = request
                .wait()
                .await
                .inspect_err(|e| warn!(url = %query.url, error = %e, "Failed to render variant"))?;
            (ready, "MISS")
        }
    };

    blob_response(&ready.path, cache_header).await
}

async fn prefetch(
    State(state): State<SharedState>,
    Json(request): Json<PrefetchRequest>,
) -> (StatusCode, Json<PrefetchResponse>) {
    let scheduled = state.cache.prefetch(&request.urls);
    info!(requested = request.urls.len(), scheduled, "Prefetch accepted");

    (StatusCode::ACCEPTED, Json(PrefetchResponse { scheduled }))
}

async fn clear_cache(State(state): State<SharedState>) -> ApiResult<StatusCode> {
    state.cache.clear_cache().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_memory_cache(State(state): State<SharedState>) -> StatusCode {
    state.cache.clear_memory_cache();
    StatusCode::NO_CONTENT
}

async fn cache_size(State(state): State<SharedState>) -> Json<CacheSizeResponse> {
    Json(CacheSizeResponse {
        current_bytes: state.cache.current_cache_size(),
        max_bytes: state.cache.max_cache_size(),
    })
}

async fn set_cache_size(
    State(state): State<SharedState>,
    Json(request): Json<SetCacheSizeRequest>,
) -> ApiResult<Json<SetCacheSizeResponse>> {
    let report = state.cache.set_max_cache_size(request.max_bytes).await?;

    Ok(Json(SetCacheSizeResponse {
        current_bytes: state.cache.current_cache_size(),
        max_bytes: state.cache.max_cache_size(),
        evicted: report.evicted.len(),
        freed_bytes: report.freed_bytes,
    }))
}

async fn set_variant_settings(
    State(state): State<SharedState>,
    Json(request): Json<VariantSettingsRequest>,
) -> ApiResult<Json<VariantSettingsResponse>> {
    if request.radius.is_some() || request.width.is_some() || request.height.is_some() {
        let spec = state
            .cache
            .default_variant()
            .with_overrides(request.radius, request.width, request.height);
        state.cache.set_default_variant(spec)?;
    }

    if let Some(enabled) = request.enabled {
        state.cache.set_variants_enabled(enabled);
    }

    Ok(Json(VariantSettingsResponse {
        enabled: state.cache.variants_enabled(),
        default_variant: state.cache.default_variant(),
    }))
}

/// Read a cached blob and wrap it in a response
async fn blob_response(path: &Path, cache_header: &'static str) -> ApiResult<Response> {
    let data = tokio::fs::read(path).await.map_err(|e| {
        warn!(path = ?path, error = %e, "Failed to read cached blob");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Cached blob is unavailable".to_string(),
        }
    })?;

    let content_type = image::guess_format(&data)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=86400"),
            (X_CACHE, cache_header),
        ],
        data,
    )
        .into_response())
}
