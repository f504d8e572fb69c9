//! HTTP request handlers
//!
//! Thin adapters between the wire and [`JobService`]: parse, delegate,
//! map errors to status codes. No pipeline logic lives here.

use crate::types::{
    FramesQuery, HealthResponse, ListQuery, NearestQuery, SearchParams, UrlSubmission,
    VideoCreateResponse, VideoListResponse, VideoSummary,
};
use crate::{fetch, ApiState};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use entity_index_common::{JobStatus, PipelineError};
use entity_index_pipeline::CreateJob;
use tracing::error;

/// Facade error envelope
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.message })),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::NotReady(_) => StatusCode::NOT_FOUND,
            PipelineError::InputInvalid(_) => StatusCode::BAD_REQUEST,
            PipelineError::Other(msg) if msg.contains("queue is full") => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Multipart upload: `video_file` (required), `voice_file` and
/// `interval_sec` (optional)
pub async fn upload_video(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut staged_video: Option<(std::path::PathBuf, String)> = None;
    let mut staged_voice: Option<std::path::PathBuf> = None;
    let mut interval_sec: Option<u32> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("malformed multipart: {e}"))
    })? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "video_file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.mp4")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::new(StatusCode::BAD_REQUEST, format!("upload read failed: {e}"))
                })?;
                if bytes.is_empty() {
                    return Err(ApiError::new(
                        StatusCode::BAD_REQUEST,
                        "video upload is empty",
                    ));
                }
                let staged = state.stage_file(&filename, &bytes).await?;
                staged_video = Some((staged, filename));
            }
            "voice_file" => {
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::new(StatusCode::BAD_REQUEST, format!("upload read failed: {e}"))
                })?;
                staged_voice = Some(state.stage_file("voice.txt", &bytes).await?);
            }
            "interval_sec" => {
                let text = field.text().await.unwrap_or_default();
                interval_sec = text.trim().parse().ok();
            }
            _ => {}
        }
    }

    let (staged_video, filename) = staged_video.ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "video_file field is required")
    })?;

    let video_id = state
        .service
        .create_job(CreateJob {
            filename,
            interval_sec,
            staged_video,
            staged_voice,
        })
        .await?;
    let job = state.service.get_job(&video_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(VideoCreateResponse {
            video_id,
            status: job.status,
            interval_sec: job.interval_sec,
        }),
    ))
}

/// URL submission: the fetcher stages the bytes, then the flow matches an
/// upload exactly
pub async fn submit_url(
    State(state): State<ApiState>,
    Json(submission): Json<UrlSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let (staged_video, filename) = fetch::fetch_to_staging(&submission.url, &state.staging_dir)
        .await
        .map_err(|e| {
            error!("Fetch failed for {}: {e}", submission.url);
            ApiError::new(StatusCode::BAD_REQUEST, format!("fetch failed: {e}"))
        })?;

    let video_id = state
        .service
        .create_job(CreateJob {
            filename,
            interval_sec: submission.interval_sec,
            staged_video,
            staged_voice: None,
        })
        .await?;
    let job = state.service.get_job(&video_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(VideoCreateResponse {
            video_id,
            status: job.status,
            interval_sec: job.interval_sec,
        }),
    ))
}

pub async fn list_videos(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("unknown status '{raw}'"))
        })?),
        None => None,
    };
    let (jobs, total) = state
        .service
        .list_jobs(status, query.page, query.page_size)
        .await?;
    Ok(Json(VideoListResponse {
        page: query.page,
        page_size: query.page_size,
        total,
        videos: jobs.iter().map(VideoSummary::from).collect(),
    }))
}

pub async fn get_video(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.get_job(&video_id).await?;
    Ok(Json(job))
}

pub async fn get_status(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.service.get_status(&video_id).await?;
    Ok(Json(status))
}

pub async fn get_report(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.service.get_report(&video_id).await?;
    Ok(Json(report))
}

pub async fn list_frames(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
    Query(query): Query<FramesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .service
        .list_frames(
            &video_id,
            query.page,
            query.page_size,
            query.annotated,
            query.entity.as_deref(),
        )
        .await?;
    Ok(Json(page))
}

pub async fn nearest_frame(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
    Query(query): Query<NearestQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let nearest = state
        .service
        .nearest_frame(
            &video_id,
            query.timestamp_sec,
            query.page_size,
            query.entity.as_deref(),
        )
        .await?;
    Ok(Json(nearest))
}

/// Serve a raw frame image
pub async fn serve_frame(
    State(state): State<ApiState>,
    Path((video_id, frame_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    serve_frame_file(&state, &video_id, &frame_name, false).await
}

/// Serve an annotated frame image
pub async fn serve_annotated_frame(
    State(state): State<ApiState>,
    Path((video_id, frame_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    serve_frame_file(&state, &video_id, &frame_name, true).await
}

async fn serve_frame_file(
    state: &ApiState,
    video_id: &str,
    frame_name: &str,
    annotated: bool,
) -> Result<Response, ApiError> {
    // Frame names are generated ordinals; anything else is not a frame
    if !frame_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "invalid frame name"));
    }

    let layout = &state.service.context().layout;
    let dir = if annotated {
        layout.annotated_dir(video_id)
    } else {
        layout.frames_dir(video_id)
    };
    let path = dir.join(frame_name);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "frame not found"))?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response())
}

pub async fn delete_video(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_job(&video_id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

pub async fn cancel_video(
    State(state): State<ApiState>,
    Path(video_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.cancel_job(&video_id).await?;
    Ok(Json(serde_json::json!({ "status": "cancelling" })))
}

pub async fn search(
    State(state): State<ApiState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.service.search(&params.into());
    Ok(Json(response))
}
