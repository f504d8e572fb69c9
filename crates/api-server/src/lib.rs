//! REST facade for the entity indexing pipeline
//!
//! Only enqueues work and reads committed state: every route delegates to
//! [`JobService`]. Single-node deployments run this next to an in-process
//! worker (see `main.rs`); the pipeline itself never depends on this crate.

mod fetch;
mod handlers;
mod types;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use entity_index_pipeline::JobService;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::*;
pub use types::*;

/// Shared facade state
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<JobService>,
    /// Uploads and fetches land here before the job id exists
    pub staging_dir: PathBuf,
}

impl ApiState {
    #[must_use]
    pub fn new(service: Arc<JobService>) -> Self {
        let staging_dir = service.context().layout.root().join("uploads");
        Self {
            service,
            staging_dir,
        }
    }

    /// Persist incoming bytes into the staging area
    pub(crate) async fn stage_file(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, handlers::ApiError> {
        let extension = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let staged = self
            .staging_dir
            .join(format!("{}.{extension}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(stage_err)?;
        tokio::fs::write(&staged, bytes).await.map_err(stage_err)?;
        Ok(staged)
    }
}

fn stage_err(e: std::io::Error) -> handlers::ApiError {
    handlers::ApiError::internal(format!("staging write failed: {e}"))
}

/// Build the router with all endpoints
#[must_use]
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/videos", post(upload_video).get(list_videos))
        .route("/api/videos/url", post(submit_url))
        .route("/api/videos/{video_id}", get(get_video).delete(delete_video))
        .route("/api/videos/{video_id}/status", get(get_status))
        .route("/api/videos/{video_id}/report", get(get_report))
        .route("/api/videos/{video_id}/cancel", post(cancel_video))
        .route("/api/videos/{video_id}/frames", get(list_frames))
        .route("/api/videos/{video_id}/frames/nearest", get(nearest_frame))
        .route("/api/videos/{video_id}/frames/{frame_name}", get(serve_frame))
        .route(
            "/api/videos/{video_id}/frames/annotated/{frame_name}",
            get(serve_annotated_frame),
        )
        .route("/api/search", get(search))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Facade listening on {addr}");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
