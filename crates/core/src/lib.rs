//! Pipeline configuration, per-job data layout, and capability interfaces
//!
//! This crate is the seam between the pipeline core and everything external
//! to it: model runtimes are consumed through the narrow traits in
//! [`capability`], all tunables live in [`config::PipelineConfig`], and the
//! on-disk artifact layout is owned by [`layout::DataLayout`].

pub mod capability;
pub mod config;
pub mod layout;

pub use capability::{
    CapabilityError, CapabilityResult, CaptionDiscovery, DetectorSet, Embedder, ObjectDetector,
    OcrReader, OpenVocabScorer, Transcriber,
};
pub use config::{PipelineConfig, StageTimeouts};
pub use layout::{write_json_atomic, DataLayout};
