//! Capability table construction
//!
//! Built once per worker process. A capability that cannot be constructed
//! (missing weights, missing binary) is recorded as skipped and its source
//! simply never contributes; the worker comes up regardless.

use entity_index_core::{DetectorSet, Embedder, PipelineConfig, Transcriber};
use entity_index_detectors::caption::{CaptionerConfig, OnnxCaptioner};
use entity_index_detectors::ocr::{OcrConfig, TesseractReader};
use entity_index_detectors::open_vocab::{ClipConfig, ClipScorer};
use entity_index_detectors::yolo::{YoloConfig, YoloDetector};
use entity_index_search::embed::OnnxTextEmbedder;
use entity_index_transcription::WhisperTranscriber;
use std::sync::Mutex;
use tracing::{info, warn};

/// Construct the detection capability table from the model directory
#[must_use]
pub fn build_detector_set(config: &PipelineConfig) -> DetectorSet {
    let mut set = DetectorSet::new();
    let models = &config.model_dir;

    let yolo_config = YoloConfig {
        confidence_threshold: config.min_confidence,
        ..YoloConfig::default()
    };
    match YoloDetector::new(&models.join("object-detection/yolov8n.onnx"), yolo_config) {
        Ok(detector) => set.yolo = Some(Mutex::new(Box::new(detector))),
        Err(e) => {
            warn!("Object detection unavailable: {e}");
            set.skip("yolo", e.to_string());
        }
    }

    if config.discovery_enabled {
        let captioner_config = CaptionerConfig {
            max_phrases: config.discovery_max_phrases,
            ..CaptionerConfig::default()
        };
        match OnnxCaptioner::new(
            &models.join("caption/blip_caption.onnx"),
            &models.join("caption/tokenizer.json"),
            captioner_config,
        ) {
            Ok(captioner) => set.discovery = Some(Mutex::new(Box::new(captioner))),
            Err(e) => {
                warn!("Caption discovery unavailable: {e}");
                set.skip("discovery", e.to_string());
            }
        }
    }

    // Verification reuses the open-vocab scorer, so either feature wants it
    if config.open_vocab_enabled || config.verify_enabled {
        match ClipScorer::new(
            &models.join("open-vocab/clip_vit_b32.onnx"),
            &models.join("open-vocab/tokenizer.json"),
            ClipConfig::default(),
        ) {
            Ok(scorer) => set.open_vocab = Some(Mutex::new(Box::new(scorer))),
            Err(e) => {
                warn!("Open-vocab scoring unavailable: {e}");
                set.skip("open_vocab", e.to_string());
            }
        }
    }

    if config.ocr_enabled {
        let ocr_config = OcrConfig {
            min_confidence: config.ocr_min_confidence,
            ..OcrConfig::default()
        };
        match TesseractReader::new(ocr_config) {
            Ok(reader) => set.ocr = Some(Mutex::new(Box::new(reader))),
            Err(e) => {
                warn!("OCR unavailable: {e}");
                set.skip("ocr", e.to_string());
            }
        }
    }

    if set.is_empty() {
        warn!("No detection capability available; jobs will complete with empty entity maps");
    } else {
        info!(
            "Detector set ready ({} sources skipped)",
            set.skipped.len()
        );
    }
    set
}

/// Construct the optional transcriber
#[must_use]
pub fn build_transcriber(config: &PipelineConfig) -> Option<Box<dyn Transcriber>> {
    match WhisperTranscriber::new(&config.model_dir.join("transcription/ggml-base.bin")) {
        Ok(transcriber) => Some(Box::new(transcriber)),
        Err(e) => {
            warn!("Transcription unavailable: {e}");
            None
        }
    }
}

/// Construct the optional text embedder for semantic search
#[must_use]
pub fn build_embedder(config: &PipelineConfig) -> Option<Box<dyn Embedder>> {
    match OnnxTextEmbedder::new(
        &config.model_dir.join("embeddings/all_minilm_l6_v2.onnx"),
        &config.model_dir.join("embeddings/tokenizer.json"),
    ) {
        Ok(embedder) => Some(Box::new(embedder)),
        Err(e) => {
            warn!("Semantic search embedder unavailable: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_models_degrade_gracefully() {
        let mut config = PipelineConfig::default();
        config.model_dir = std::path::PathBuf::from("/nonexistent/models");

        let set = build_detector_set(&config);
        // YOLO, discovery and open-vocab all need weights that are absent;
        // OCR depends on a system tesseract install and may go either way
        assert!(set.yolo.is_none());
        assert!(set.discovery.is_none());
        assert!(set.open_vocab.is_none());
        assert!(set.skipped.iter().any(|(name, _)| name == "yolo"));

        assert!(build_transcriber(&config).is_none());
        assert!(build_embedder(&config).is_none());
    }
}
