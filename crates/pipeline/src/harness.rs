//! Processing harness: the capability bundle one worker carries
//!
//! Built once per worker process and shared by every job it runs. The frame
//! source is a capability like the detectors so the whole pipeline can be
//! driven with synthetic stand-ins in tests.

use entity_index_aggregation::AggregationOptions;
use entity_index_common::Result;
use entity_index_core::{DetectorSet, PipelineConfig, Transcriber};
use entity_index_detectors::FusionOptions;
use entity_index_frames::{SampledFrame, SamplingOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Frame extraction capability: primary + fallback path behind one call
pub trait FrameSource: Send + Sync {
    fn probe_duration(&self, video_path: &Path) -> Result<f64>;

    fn extract(
        &self,
        video_path: &Path,
        frames_dir: &Path,
        interval_sec: u32,
        sampling: &SamplingOptions,
    ) -> Result<Vec<SampledFrame>>;
}

/// Production frame source over ffmpeg/ffprobe
pub struct FfmpegFrameSource;

impl FrameSource for FfmpegFrameSource {
    fn probe_duration(&self, video_path: &Path) -> Result<f64> {
        entity_index_frames::probe_duration(video_path)
    }

    fn extract(
        &self,
        video_path: &Path,
        frames_dir: &Path,
        interval_sec: u32,
        sampling: &SamplingOptions,
    ) -> Result<Vec<SampledFrame>> {
        entity_index_frames::extract_frames(video_path, frames_dir, interval_sec, sampling)
    }
}

/// Everything a worker needs to process jobs
pub struct ProcessingHarness {
    pub frame_source: Arc<dyn FrameSource>,
    pub detectors: Arc<DetectorSet>,
    pub transcriber: Option<Arc<Mutex<Box<dyn Transcriber>>>>,
    pub fusion: FusionOptions,
    pub aggregation: AggregationOptions,
    pub sampling: SamplingOptions,
    pub annotate_frames: bool,
}

impl ProcessingHarness {
    /// Derive the per-stage option bundles from the worker configuration
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        frame_source: Arc<dyn FrameSource>,
        detectors: Arc<DetectorSet>,
        transcriber: Option<Box<dyn Transcriber>>,
    ) -> Self {
        Self {
            frame_source,
            detectors,
            transcriber: transcriber.map(|t| Arc::new(Mutex::new(t))),
            fusion: FusionOptions::from_config(config),
            aggregation: AggregationOptions {
                min_consecutive: config.min_consecutive,
                open_vocab_min_consecutive: config.open_vocab_min_consecutive,
                discovery_min_consecutive: config.discovery_min_consecutive,
                confidence_min_score: config.confidence_min_score,
                verify_enabled: config.verify_enabled,
                discovery_every_n: config.discovery_every_n,
                open_vocab_every_n: config.open_vocab_every_n,
                verify_every_n: config.verify_every_n,
                ocr_every_n: config.ocr_every_n,
            },
            sampling: SamplingOptions::new(
                config.smart_sampling_enabled,
                config.smart_sampling_diff_threshold,
                config.smart_sampling_min_keep,
            ),
            annotate_frames: config.annotate_frames,
        }
    }
}
