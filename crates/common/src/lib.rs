//! Common types and utilities for the entity indexing pipeline
//!
//! Shared data model (jobs, frames, detections, entity summaries, reports),
//! the pipeline error taxonomy, and label/timestamp helpers used by every
//! other crate in the workspace.

pub mod normalize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Pipeline errors, grouped by kind rather than by origin
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Frame extraction produced no frames: {0}")]
    ExtractionFailed(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Capability runtime error: {0}")]
    CapabilityRuntime(String),

    #[error("Transcription error: {0}")]
    Transcript(String),

    #[error("stage_timeout:{0}")]
    StageTimeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Report not ready for job {0}")]
    NotReady(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Database/string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the database representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A job never leaves a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal transitions form `queued -> processing -> {completed, failed}`.
    /// Re-asserting the current state is allowed (progress updates).
    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Processing) => true,
            (Self::Processing, Self::Completed | Self::Failed) => true,
            (a, b) if *a == b && !a.is_terminal() => true,
            _ => false,
        }
    }
}

/// Producer of a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Yolo,
    Discovery,
    OpenVocab,
    Verify,
    Ocr,
}

impl Source {
    /// Wire/report representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yolo => "yolo",
            Self::Discovery => "discovery",
            Self::OpenVocab => "open_vocab",
            Self::Verify => "verify",
            Self::Ocr => "ocr",
        }
    }

    /// Number of distinct sources, used by the confidence formula
    pub const COUNT: usize = 5;
}

/// Axis-aligned bounding box in pixel units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Clip the box to image bounds. Boxes that collapse to zero area
    /// after clipping return `None`.
    #[must_use]
    pub fn clipped(&self, image_w: u32, image_h: u32) -> Option<Self> {
        let max_x = image_w as f32;
        let max_y = image_h as f32;
        let x0 = self.x.clamp(0.0, max_x);
        let y0 = self.y.clamp(0.0, max_y);
        let x1 = (self.x + self.w).clamp(0.0, max_x);
        let y1 = (self.y + self.h).clamp(0.0, max_y);
        let w = x1 - x0;
        let h = y1 - y0;
        if w <= 0.0 || h <= 0.0 {
            return None;
        }
        Some(Self::new(x0, y0, w, h))
    }
}

/// A single observation attached to a frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Canonical label (lowercased, trimmed)
    pub label: String,
    pub source: Source,
    /// Confidence in [0, 1]
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    /// Raw OCR payload before normalization (OCR source only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl Detection {
    #[must_use]
    pub fn new(label: impl Into<String>, source: Source, confidence: f32) -> Self {
        Self {
            label: label.into(),
            source,
            confidence,
            bbox: None,
            raw_text: None,
        }
    }
}

/// A sampled still image and its attached detections, as persisted in
/// `frames/<video_id>/frames.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Dense, 0-based index over the retained sample sequence
    pub frame_index: usize,
    /// Actual seconds into the video (explicit so smart sampling survives)
    pub timestamp_sec: f64,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_filename: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Per-frame capability errors, swallowed rather than failing the job
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// On-disk shape of `frames.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FramesIndex {
    pub frames: Vec<FrameRecord>,
}

/// A closed interval of seconds during which an entity was continuously
/// present, with human-readable `mm:ss` endpoint labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_sec: f64,
    pub end_sec: f64,
    pub start_label: String,
    pub end_label: String,
}

impl TimeRange {
    #[must_use]
    pub fn new(start_sec: f64, end_sec: f64) -> Self {
        Self {
            start_sec,
            end_sec,
            start_label: format_timestamp(start_sec),
            end_label: format_timestamp(end_sec),
        }
    }
}

/// Per-label aggregation result in the final report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    /// Surviving detection instances across all frames
    pub count: usize,
    /// appearances / frames_analyzed, rounded to 4 decimals
    pub presence: f64,
    /// Distinct frames in which the entity survived filtering
    pub appearances: usize,
    pub time_ranges: Vec<TimeRange>,
    /// Weighted evidence score in [0, 1], rounded to 4 decimals
    pub confidence_score: f64,
    /// Contributing source names, sorted
    pub sources: Vec<String>,
}

/// One transcript segment with timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub segment_id: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Coarse audio characteristics derived from the transcription pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioAnalysis {
    /// Fraction of the video duration covered by speech segments
    pub speech_ratio: f64,
    pub speech_seconds: f64,
    pub music_detected: bool,
    pub vad_available: bool,
}

/// Transcript artifact attached to the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub language: String,
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_analysis: Option<AudioAnalysis>,
    /// Set when transcription failed; the job still completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The canonical, durable report artifact. Written once, atomically.
///
/// `entities` is a `BTreeMap` so serialization order is deterministic and
/// re-running aggregation yields a byte-identical file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub video_id: String,
    pub filename: String,
    pub duration_sec: f64,
    pub interval_sec: u32,
    pub frames_analyzed: usize,
    pub unique_entities: usize,
    pub entities: BTreeMap<String, EntitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
}

/// A durable job record as held by the state store
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub video_id: String,
    pub filename: String,
    pub status: JobStatus,
    /// Percent in [0, 100], non-decreasing until terminal
    pub progress: f64,
    pub current_stage: Option<String>,
    pub status_text: Option<String>,
    pub interval_sec: u32,
    pub duration_sec: Option<f64>,
    pub frames_analyzed: Option<i64>,
    pub unique_entities: Option<i64>,
    /// JSON-serialized entity summary map, populated on completion
    pub entities_json: Option<String>,
    pub original_path: Option<String>,
    pub voice_path: Option<String>,
    pub frames_path: Option<String>,
    pub report_path: Option<String>,
    /// Only set when `status = failed`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Render seconds as `mm:ss` for human-readable range labels
#[must_use]
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.round() as i64;
    let total = total.max(0);
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Round to one decimal (seconds in the report)
#[must_use]
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Round to four decimals (presence, confidence)
#[must_use]
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
