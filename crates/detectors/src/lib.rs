//! Detector fusion
//!
//! Runs up to five detection sources over each extracted frame, each on its
//! own sampling cadence with its own confidence threshold, and normalizes
//! everything into flat [`Detection`] lists. A source contributes on frame
//! *k* iff `k % every_n == 0`, counted over the pruned sample sequence.
//!
//! Per-frame and per-source failures are swallowed into the frame's error
//! log; only a YOLO failure on *every* frame is escalated by the caller.

pub mod caption;
pub mod discovery;
pub mod ocr;
pub mod open_vocab;
pub mod yolo;

use entity_index_common::normalize::{canonicalize_label, normalize_label};
use entity_index_common::{Detection, Source};
use entity_index_core::{DetectorSet, PipelineConfig};
use image::RgbImage;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default COCO -> domain label mapping applied to the object detector.
/// Unmapped classes are dropped: the table doubles as the domain filter.
#[must_use]
pub fn default_label_map() -> HashMap<String, String> {
    let entries = [
        ("person", "military personnel"),
        ("car", "military vehicle"),
        ("truck", "armored vehicle"),
        ("bus", "military vehicle"),
        ("motorcycle", "military vehicle"),
        ("bicycle", "military vehicle"),
        ("train", "military vehicle"),
        ("boat", "military vehicle"),
        ("airplane", "aircraft"),
        ("helicopter", "helicopter"),
        ("knife", "weapon"),
        ("scissors", "weapon"),
        ("baseball bat", "weapon"),
        ("backpack", "equipment"),
        ("handbag", "equipment"),
        ("suitcase", "equipment"),
        ("laptop", "equipment"),
        ("cell phone", "equipment"),
        ("remote", "equipment"),
    ];
    entries
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

/// Everything the fusion pass needs from the worker configuration
#[derive(Debug, Clone)]
pub struct FusionOptions {
    pub min_confidence: f32,
    pub label_map: HashMap<String, String>,

    pub discovery_enabled: bool,
    pub discovery_every_n: usize,
    pub discovery_min_score: f32,
    pub discovery_only_military: bool,

    pub open_vocab_enabled: bool,
    pub open_vocab_every_n: usize,
    pub open_vocab_threshold: f32,
    pub open_vocab_labels: Vec<String>,

    pub verify_enabled: bool,
    pub verify_every_n: usize,
    pub verify_threshold: f32,
    pub verify_max_labels: usize,

    pub ocr_enabled: bool,
    pub ocr_every_n: usize,
}

impl FusionOptions {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            label_map: default_label_map(),
            discovery_enabled: config.discovery_enabled,
            discovery_every_n: config.discovery_every_n,
            discovery_min_score: config.discovery_min_score,
            discovery_only_military: config.discovery_only_military,
            open_vocab_enabled: config.open_vocab_enabled,
            open_vocab_every_n: config.open_vocab_every_n,
            open_vocab_threshold: config.open_vocab_threshold,
            open_vocab_labels: config.open_vocab_labels.clone(),
            verify_enabled: config.verify_enabled,
            verify_every_n: config.verify_every_n,
            verify_threshold: config.verify_threshold,
            verify_max_labels: config.verify_max_labels,
            ocr_enabled: config.ocr_enabled,
            ocr_every_n: config.ocr_every_n,
        }
    }
}

/// Result of fusing all due sources over one frame
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub detections: Vec<Detection>,
    pub errors: Vec<String>,
}

/// Stateful fusion pass over one job's frame sequence.
///
/// State carried across frames: the discovery tally feeding the verification
/// pass, and the YOLO failure count used for the mandatory-source policy.
pub struct FusionEngine {
    options: FusionOptions,
    /// Discovery label -> frames on which it was proposed
    discovery_tally: HashMap<String, usize>,
    yolo_attempts: usize,
    yolo_failures: usize,
}

impl FusionEngine {
    #[must_use]
    pub fn new(options: FusionOptions) -> Self {
        Self {
            options,
            discovery_tally: HashMap::new(),
            yolo_attempts: 0,
            yolo_failures: 0,
        }
    }

    fn due(k: usize, every_n: usize) -> bool {
        k % every_n.max(1) == 0
    }

    /// Run every due source over frame `k`
    pub fn process_frame(&mut self, set: &DetectorSet, k: usize, image: &RgbImage) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();

        self.run_yolo(set, image, &mut outcome);
        if self.options.discovery_enabled && Self::due(k, self.options.discovery_every_n) {
            self.run_discovery(set, image, &mut outcome);
        }
        if self.options.open_vocab_enabled && Self::due(k, self.options.open_vocab_every_n) {
            self.run_open_vocab(set, image, &mut outcome);
        }
        if self.options.verify_enabled && Self::due(k, self.options.verify_every_n) {
            self.run_verify(set, image, &mut outcome);
        }
        if self.options.ocr_enabled && Self::due(k, self.options.ocr_every_n) {
            self.run_ocr(set, image, &mut outcome);
        }

        debug!(
            "Frame {}: {} detections, {} source errors",
            k,
            outcome.detections.len(),
            outcome.errors.len()
        );
        outcome
    }

    /// True when the mandatory object detector failed on every frame it was
    /// attempted on
    #[must_use]
    pub fn yolo_failed_on_every_frame(&self) -> bool {
        self.yolo_attempts > 0 && self.yolo_failures == self.yolo_attempts
    }

    fn run_yolo(&mut self, set: &DetectorSet, image: &RgbImage, outcome: &mut FrameOutcome) {
        let Some(detector) = set.yolo.as_ref() else {
            return;
        };
        self.yolo_attempts += 1;

        let result = match detector.lock() {
            Ok(mut guard) => guard.detect(image),
            Err(_) => {
                self.yolo_failures += 1;
                outcome.errors.push("yolo: detector mutex poisoned".to_string());
                return;
            }
        };

        match result {
            Ok(detections) => {
                let (w, h) = image.dimensions();
                for mut det in detections {
                    if det.confidence < self.options.min_confidence {
                        continue;
                    }
                    let Some(raw) = normalize_label(&det.label) else {
                        continue;
                    };
                    // The mapping table is also the domain filter
                    let Some(mapped) = self.options.label_map.get(&raw) else {
                        continue;
                    };
                    det.label = mapped.clone();
                    det.bbox = det.bbox.and_then(|b| b.clipped(w, h));
                    outcome.detections.push(det);
                }
            }
            Err(e) => {
                self.yolo_failures += 1;
                outcome.errors.push(format!("yolo: {e}"));
            }
        }
    }

    fn run_discovery(&mut self, set: &DetectorSet, image: &RgbImage, outcome: &mut FrameOutcome) {
        let Some(discovery) = set.discovery.as_ref() else {
            return;
        };
        let result = match discovery.lock() {
            Ok(mut guard) => guard.candidates(image),
            Err(_) => {
                outcome.errors.push("discovery: mutex poisoned".to_string());
                return;
            }
        };

        match result {
            Ok(candidates) => {
                for (raw_label, score) in candidates {
                    if score < self.options.discovery_min_score {
                        continue;
                    }
                    let label = canonicalize_label(&raw_label);
                    if label.is_empty() {
                        continue;
                    }
                    if self.options.discovery_only_military && !discovery::is_domain_term(&label) {
                        continue;
                    }
                    *self.discovery_tally.entry(label.clone()).or_insert(0) += 1;
                    outcome
                        .detections
                        .push(Detection::new(label, Source::Discovery, score));
                }
            }
            Err(e) => outcome.errors.push(format!("discovery: {e}")),
        }
    }

    fn run_open_vocab(&mut self, set: &DetectorSet, image: &RgbImage, outcome: &mut FrameOutcome) {
        let Some(scorer) = set.open_vocab.as_ref() else {
            return;
        };
        if self.options.open_vocab_labels.is_empty() {
            return;
        }
        let result = match scorer.lock() {
            Ok(mut guard) => guard.score(image, &self.options.open_vocab_labels),
            Err(_) => {
                outcome.errors.push("open_vocab: mutex poisoned".to_string());
                return;
            }
        };

        match result {
            Ok(scores) => {
                for (label, score) in scores {
                    if score < self.options.open_vocab_threshold {
                        continue;
                    }
                    let label = canonicalize_label(&label);
                    if label.is_empty() {
                        continue;
                    }
                    outcome
                        .detections
                        .push(Detection::new(label, Source::OpenVocab, score));
                }
            }
            Err(e) => outcome.errors.push(format!("open_vocab: {e}")),
        }
    }

    /// Re-score the most frequently discovered labels against the frame;
    /// confirmations show up as `verify` detections.
    fn run_verify(&mut self, set: &DetectorSet, image: &RgbImage, outcome: &mut FrameOutcome) {
        let Some(scorer) = set.open_vocab.as_ref() else {
            return;
        };
        let top_labels = self.top_discovered_labels();
        if top_labels.is_empty() {
            return;
        }

        let result = match scorer.lock() {
            Ok(mut guard) => guard.score(image, &top_labels),
            Err(_) => {
                outcome.errors.push("verify: mutex poisoned".to_string());
                return;
            }
        };

        match result {
            Ok(scores) => {
                for (label, score) in scores {
                    if score >= self.options.verify_threshold {
                        outcome
                            .detections
                            .push(Detection::new(label, Source::Verify, score));
                    }
                }
            }
            Err(e) => outcome.errors.push(format!("verify: {e}")),
        }
    }

    fn run_ocr(&mut self, set: &DetectorSet, image: &RgbImage, outcome: &mut FrameOutcome) {
        let Some(reader) = set.ocr.as_ref() else {
            return;
        };
        let result = match reader.lock() {
            Ok(mut guard) => guard.read(image),
            Err(_) => {
                outcome.errors.push("ocr: mutex poisoned".to_string());
                return;
            }
        };

        match result {
            Ok(detections) => {
                let (w, h) = image.dimensions();
                for mut det in detections {
                    det.bbox = det.bbox.and_then(|b| b.clipped(w, h));
                    outcome.detections.push(det);
                }
            }
            Err(e) => {
                warn!("OCR failed on frame: {e}");
                outcome.errors.push(format!("ocr: {e}"));
            }
        }
    }

    /// Most frequently proposed discovery labels, capped at `verify_max_labels`
    fn top_discovered_labels(&self) -> Vec<String> {
        let mut tally: Vec<(&String, &usize)> = self.discovery_tally.iter().collect();
        tally.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        tally
            .into_iter()
            .take(self.options.verify_max_labels)
            .map(|(label, _)| label.clone())
            .collect()
    }
}
