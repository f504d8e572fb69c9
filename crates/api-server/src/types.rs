//! API request and response types

use entity_index_common::{Job, JobStatus};
use serde::{Deserialize, Serialize};

/// Response to a submission
#[derive(Debug, Clone, Serialize)]
pub struct VideoCreateResponse {
    pub video_id: String,
    pub status: JobStatus,
    pub interval_sec: u32,
}

/// URL submission body
#[derive(Debug, Clone, Deserialize)]
pub struct UrlSubmission {
    pub url: String,
    #[serde(default)]
    pub interval_sec: Option<u32>,
}

/// Listing query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// Frame listing query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct FramesQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_frames_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub annotated: bool,
    #[serde(default)]
    pub entity: Option<String>,
}

fn default_frames_page_size() -> u32 {
    24
}

/// Nearest-frame query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct NearestQuery {
    pub timestamp_sec: f64,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default = "default_frames_page_size")]
    pub page_size: u32,
}

/// Search query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_similarity")]
    pub similarity: f64,
    #[serde(default)]
    pub min_presence: f64,
    #[serde(default)]
    pub min_frames: usize,
}

fn default_similarity() -> f64 {
    0.7
}

impl From<SearchParams> for entity_index_search::SearchQuery {
    fn from(params: SearchParams) -> Self {
        Self {
            q: params.q,
            similarity: params.similarity,
            min_presence: params.min_presence,
            min_frames: params.min_frames,
        }
    }
}

/// Job summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct VideoSummary {
    pub video_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: f64,
    pub duration_sec: Option<f64>,
    pub interval_sec: u32,
    pub frames_analyzed: Option<i64>,
    pub unique_entities: Option<i64>,
    pub created_at: String,
}

impl From<&Job> for VideoSummary {
    fn from(job: &Job) -> Self {
        Self {
            video_id: job.video_id.clone(),
            filename: job.filename.clone(),
            status: job.status,
            progress: job.progress,
            duration_sec: job.duration_sec,
            interval_sec: job.interval_sec,
            frames_analyzed: job.frames_analyzed,
            unique_entities: job.unique_entities,
            created_at: job.created_at.to_rfc3339(),
        }
    }
}

/// Paged job listing
#[derive(Debug, Clone, Serialize)]
pub struct VideoListResponse {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub videos: Vec<VideoSummary>,
}

/// Health check payload
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_defaults() {
        let query: FramesQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.page, 1);
        assert_eq!(query.page_size, 24);
        assert!(!query.annotated);
        assert!(query.entity.is_none());

        let search: SearchParams = serde_json::from_str(r#"{"q":"jet"}"#).unwrap();
        assert_eq!(search.similarity, 0.7);
        assert_eq!(search.min_frames, 0);
    }
}
