//! Worker configuration
//!
//! All options are read from the environment once at worker start, with the
//! documented defaults. Env names carry the `ENTITY_INDEX_` prefix.

use std::path::PathBuf;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Soft per-stage time budgets in seconds
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub extracting_frames: u64,
    pub transcribing_audio: u64,
    pub detecting_entities: u64,
    pub aggregating_report: u64,
    pub indexing_search: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            extracting_frames: 300,
            transcribing_audio: 600,
            detecting_entities: 3600,
            aggregating_report: 120,
            indexing_search: 60,
        }
    }
}

impl StageTimeouts {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            extracting_frames: env_parse("ENTITY_INDEX_TIMEOUT_EXTRACT", d.extracting_frames),
            transcribing_audio: env_parse("ENTITY_INDEX_TIMEOUT_TRANSCRIBE", d.transcribing_audio),
            detecting_entities: env_parse("ENTITY_INDEX_TIMEOUT_DETECT", d.detecting_entities),
            aggregating_report: env_parse("ENTITY_INDEX_TIMEOUT_AGGREGATE", d.aggregating_report),
            indexing_search: env_parse("ENTITY_INDEX_TIMEOUT_INDEX", d.indexing_search),
        }
    }

    /// Budget for a stage by name; unknown stages get the detection budget
    #[must_use]
    pub fn for_stage(&self, stage: &str) -> Duration {
        let secs = match stage {
            "extracting_frames" => self.extracting_frames,
            "transcribing_audio" => self.transcribing_audio,
            "detecting_entities" => self.detecting_entities,
            "aggregating_report" => self.aggregating_report,
            "indexing_search" => self.indexing_search,
            _ => self.detecting_entities,
        };
        Duration::from_secs(secs)
    }
}

/// Complete pipeline configuration, read once at worker start
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the persisted file layout
    pub data_dir: PathBuf,
    /// SQLite URL for the state store; defaults to a file under `data_dir`
    pub state_db_url: String,
    /// Out-of-process broker URL; empty selects the in-process queue
    pub broker_url: String,
    /// Directory holding model weights for the optional capabilities
    pub model_dir: PathBuf,

    pub default_interval_sec: u32,
    pub smart_sampling_enabled: bool,
    pub smart_sampling_diff_threshold: f64,
    pub smart_sampling_min_keep: usize,

    pub min_confidence: f32,
    pub min_consecutive: usize,
    pub annotate_frames: bool,

    pub open_vocab_enabled: bool,
    pub open_vocab_threshold: f32,
    pub open_vocab_every_n: usize,
    pub open_vocab_min_consecutive: usize,
    pub open_vocab_labels: Vec<String>,

    pub discovery_enabled: bool,
    pub discovery_every_n: usize,
    pub discovery_min_score: f32,
    pub discovery_min_consecutive: usize,
    pub discovery_max_phrases: usize,
    pub discovery_only_military: bool,

    pub verify_enabled: bool,
    pub verify_threshold: f32,
    pub verify_every_n: usize,
    pub verify_max_labels: usize,

    pub ocr_enabled: bool,
    pub ocr_every_n: usize,
    /// Vendor confidence floor on a 0-100 scale
    pub ocr_min_confidence: i32,

    /// Labels scoring below this are dropped from the final report
    pub confidence_min_score: f64,
    /// A `processing` job older than this is considered abandoned
    pub stale_after: Duration,

    /// Concurrent jobs per worker process
    pub worker_concurrency: usize,
    /// Bound of the in-process task queue (backpressure signal)
    pub queue_capacity: usize,
    pub stage_timeouts: StageTimeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(env_or("ENTITY_INDEX_DATA_DIR", "./data"));
        let default_db = format!("sqlite://{}/state.db?mode=rwc", data_dir.display());
        Self {
            state_db_url: env_or("ENTITY_INDEX_STATE_DB_URL", &default_db),
            broker_url: env_or("ENTITY_INDEX_BROKER_URL", ""),
            model_dir: PathBuf::from(env_or("ENTITY_INDEX_MODEL_DIR", "./models")),
            data_dir,

            default_interval_sec: env_parse("ENTITY_INDEX_DEFAULT_INTERVAL", 5u32).max(1),
            smart_sampling_enabled: env_bool("ENTITY_INDEX_SMART_SAMPLING", true),
            smart_sampling_diff_threshold: env_parse("ENTITY_INDEX_SMART_SAMPLING_DIFF", 0.06),
            smart_sampling_min_keep: env_parse("ENTITY_INDEX_SMART_SAMPLING_MIN_KEEP", 6usize),

            min_confidence: env_parse("ENTITY_INDEX_MIN_CONFIDENCE", 0.25f32),
            min_consecutive: env_parse("ENTITY_INDEX_MIN_CONSECUTIVE", 2usize),
            annotate_frames: env_bool("ENTITY_INDEX_ANNOTATE_FRAMES", true),

            open_vocab_enabled: env_bool("ENTITY_INDEX_OPEN_VOCAB", false),
            open_vocab_threshold: env_parse("ENTITY_INDEX_OPEN_VOCAB_THRESHOLD", 0.27f32),
            open_vocab_every_n: env_parse("ENTITY_INDEX_OPEN_VOCAB_EVERY_N", 1usize).max(1),
            open_vocab_min_consecutive: env_parse("ENTITY_INDEX_OPEN_VOCAB_MIN_CONSECUTIVE", 1usize),
            open_vocab_labels: env_list("ENTITY_INDEX_OPEN_VOCAB_LABELS"),

            discovery_enabled: env_bool("ENTITY_INDEX_DISCOVERY", true),
            discovery_every_n: env_parse("ENTITY_INDEX_DISCOVERY_EVERY_N", 1usize).max(1),
            discovery_min_score: env_parse("ENTITY_INDEX_DISCOVERY_MIN_SCORE", 0.2f32),
            discovery_min_consecutive: env_parse("ENTITY_INDEX_DISCOVERY_MIN_CONSECUTIVE", 1usize),
            discovery_max_phrases: env_parse("ENTITY_INDEX_DISCOVERY_MAX_PHRASES", 8usize),
            discovery_only_military: env_bool("ENTITY_INDEX_DISCOVERY_ONLY_MILITARY", true),

            verify_enabled: env_bool("ENTITY_INDEX_VERIFY", true),
            verify_threshold: env_parse("ENTITY_INDEX_VERIFY_THRESHOLD", 0.27f32),
            verify_every_n: env_parse("ENTITY_INDEX_VERIFY_EVERY_N", 3usize).max(1),
            verify_max_labels: env_parse("ENTITY_INDEX_VERIFY_MAX_LABELS", 12usize),

            ocr_enabled: env_bool("ENTITY_INDEX_OCR", true),
            ocr_every_n: env_parse("ENTITY_INDEX_OCR_EVERY_N", 4usize).max(1),
            ocr_min_confidence: env_parse("ENTITY_INDEX_OCR_MIN_CONFIDENCE", 60i32),

            confidence_min_score: env_parse("ENTITY_INDEX_CONFIDENCE_MIN_SCORE", 0.1),
            stale_after: Duration::from_secs(env_parse("ENTITY_INDEX_STALE_AFTER_SECS", 900u64)),

            worker_concurrency: env_parse("ENTITY_INDEX_WORKER_CONCURRENCY", 2usize).max(1),
            queue_capacity: env_parse("ENTITY_INDEX_QUEUE_CAPACITY", 64usize).max(1),
            stage_timeouts: StageTimeouts::from_env(),
        }
    }
}

impl PipelineConfig {
    /// Clamp a submitter-provided interval to the supported range
    #[must_use]
    pub fn clamp_interval(&self, interval_sec: Option<u32>) -> u32 {
        interval_sec.unwrap_or(self.default_interval_sec).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_interval_sec, 5);
        assert_eq!(config.min_consecutive, 2);
        assert!((config.smart_sampling_diff_threshold - 0.06).abs() < 1e-9);
        assert_eq!(config.smart_sampling_min_keep, 6);
        assert_eq!(config.ocr_every_n, 4);
        assert_eq!(config.ocr_min_confidence, 60);
        assert_eq!(config.verify_max_labels, 12);
        assert_eq!(config.stale_after, Duration::from_secs(900));
        assert!(config.discovery_enabled);
        assert!(!config.open_vocab_enabled);
    }

    #[test]
    fn test_interval_clamping() {
        let config = PipelineConfig::default();
        assert_eq!(config.clamp_interval(None), 5);
        assert_eq!(config.clamp_interval(Some(0)), 1);
        assert_eq!(config.clamp_interval(Some(10)), 10);
    }

    #[test]
    fn test_stage_timeouts() {
        let timeouts = StageTimeouts::default();
        assert_eq!(
            timeouts.for_stage("extracting_frames"),
            Duration::from_secs(300)
        );
        assert_eq!(
            timeouts.for_stage("detecting_entities"),
            Duration::from_secs(3600)
        );
    }
}
