//! Capability interfaces for externally supplied models
//!
//! The pipeline never talks to a model runtime directly. Each engine is
//! consumed through one of the narrow traits below, and every capability may
//! report [`CapabilityError::Unavailable`] at construction time (missing
//! binary, missing weights). The stage driver treats an unavailable optional
//! capability as "skip this source" rather than failing the job.

use entity_index_common::{Detection, Transcript};
use image::RgbImage;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Errors a capability may raise
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The capability cannot be constructed on this host
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The capability failed on a particular input
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Object detection over a single decoded frame.
///
/// Must never raise on a decodable frame; an empty list is a valid result.
pub trait ObjectDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> CapabilityResult<Vec<Detection>>;
}

/// Caption-based entity discovery: candidate labels with per-label scores
/// in [0, 1], already filtered against the generic-phrase stop list.
pub trait CaptionDiscovery: Send {
    fn candidates(&mut self, image: &RgbImage) -> CapabilityResult<Vec<(String, f32)>>;
}

/// Open-vocabulary scoring of a fixed label list against a frame.
///
/// Used both for `open_vocab` detection and for `verify` confirmation of
/// discovery candidates.
pub trait OpenVocabScorer: Send {
    fn score(
        &mut self,
        image: &RgbImage,
        labels: &[String],
    ) -> CapabilityResult<HashMap<String, f32>>;
}

/// Text reading over a frame; confidences are normalized to [0, 1]
pub trait OcrReader: Send {
    fn read(&mut self, image: &RgbImage) -> CapabilityResult<Vec<Detection>>;
}

/// Speech-to-text over the original video file. Always returns a value;
/// "no speech" is a transcript with empty text, not an error.
pub trait Transcriber: Send {
    fn transcribe(&mut self, video_path: &Path, duration_sec: f64) -> CapabilityResult<Transcript>;
}

/// Text embedding for semantic search. Optional; the search indexer degrades
/// to token overlap when absent.
pub trait Embedder: Send {
    fn embed(&mut self, text: &str) -> CapabilityResult<Vec<f32>>;
}

/// The capability table a worker builds once at startup.
///
/// Model handles are expensive and not assumed thread-safe, so each slot is a
/// mutex-guarded singleton; calls are serialized onto it.
#[derive(Default)]
pub struct DetectorSet {
    pub yolo: Option<Mutex<Box<dyn ObjectDetector>>>,
    pub discovery: Option<Mutex<Box<dyn CaptionDiscovery>>>,
    pub open_vocab: Option<Mutex<Box<dyn OpenVocabScorer>>>,
    pub ocr: Option<Mutex<Box<dyn OcrReader>>>,
    /// Capabilities that failed construction, with the reason, for the
    /// per-job stage log
    pub skipped: Vec<(String, String)>,
}

impl DetectorSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an unavailable capability
    pub fn skip(&mut self, name: &str, reason: impl Into<String>) {
        self.skipped.push((name.to_string(), reason.into()));
    }

    /// True when no detection source at all is available
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.yolo.is_none()
            && self.discovery.is_none()
            && self.open_vocab.is_none()
            && self.ocr.is_none()
    }
}
