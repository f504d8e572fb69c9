//! Frame extractor
//!
//! Samples still frames from a video on a uniform grid at `interval_sec`,
//! writing JPEGs with zero-padded ordinal names into the per-job frames
//! directory. Two extraction paths are tried in order: a primary ffmpeg
//! invocation, and a tolerant fallback used when the primary produces zero
//! frames or fails outright. Producing zero frames on both paths is
//! [`PipelineError::ExtractionFailed`].
//!
//! When smart sampling is enabled the uniform grid is pruned: successive
//! samples whose normalized pixel-difference score falls below the configured
//! threshold collapse into a single representative. Retained frames keep
//! their explicit timestamps so downstream aggregation works in actual
//! seconds rather than grid positions.

pub mod sampling;

use entity_index_common::{FrameRecord, PipelineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub use sampling::SamplingOptions;

/// A retained sample: dense index, explicit timestamp, on-disk location
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub index: usize,
    pub timestamp_sec: f64,
    pub filename: String,
    pub path: PathBuf,
}

impl SampledFrame {
    /// Convert to the persisted record shape (detections attached later)
    #[must_use]
    pub fn into_record(self) -> FrameRecord {
        FrameRecord {
            frame_index: self.index,
            timestamp_sec: self.timestamp_sec,
            filename: self.filename,
            annotated_filename: None,
            detections: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Probe the container duration in seconds via ffprobe
pub fn probe_duration(video_path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(video_path)
        .output()
        .map_err(|e| PipelineError::InputInvalid(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(PipelineError::InputInvalid(format!(
            "ffprobe failed for {}",
            video_path.display()
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::InputInvalid(format!("unparseable duration for {}", video_path.display())))
}

/// Extract frames at `interval_sec`, apply smart sampling, and return the
/// retained samples in ascending timestamp order.
pub fn extract_frames(
    video_path: &Path,
    frames_dir: &Path,
    interval_sec: u32,
    sampling: &SamplingOptions,
) -> Result<Vec<SampledFrame>> {
    fs::create_dir_all(frames_dir)?;

    let files = match run_ffmpeg_grid(video_path, frames_dir, interval_sec, false) {
        Ok(files) if !files.is_empty() => files,
        Ok(_) | Err(_) => {
            warn!(
                "Primary extraction produced no frames for {}, trying fallback decode",
                video_path.display()
            );
            clear_frames(frames_dir)?;
            run_ffmpeg_grid(video_path, frames_dir, interval_sec, true)?
        }
    };

    if files.is_empty() {
        return Err(PipelineError::ExtractionFailed(format!(
            "both extraction paths produced zero frames for {}",
            video_path.display()
        )));
    }

    // Uniform grid timestamps: ordinal n (1-based) was sampled at (n-1) * interval
    let grid: Vec<SampledFrame> = files
        .into_iter()
        .enumerate()
        .map(|(i, path)| SampledFrame {
            index: i,
            timestamp_sec: (i as u32 * interval_sec) as f64,
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
        })
        .collect();

    let total = grid.len();
    let kept = if sampling.enabled {
        sampling::prune_similar(grid, sampling)?
    } else {
        grid
    };
    info!(
        "Extracted {} frames ({} after smart sampling) from {}",
        total,
        kept.len(),
        video_path.display()
    );

    Ok(kept)
}

/// One ffmpeg pass over the video with the fps filter. The fallback path
/// adds tolerant decode flags for damaged or oddly muxed containers.
fn run_ffmpeg_grid(
    video_path: &Path,
    frames_dir: &Path,
    interval_sec: u32,
    tolerant: bool,
) -> Result<Vec<PathBuf>> {
    let output_pattern = frames_dir.join("frame_%06d.jpg");
    let video_path_str = video_path
        .to_str()
        .ok_or_else(|| PipelineError::InputInvalid("non-UTF8 video path".to_string()))?;
    let output_pattern_str = output_pattern
        .to_str()
        .ok_or_else(|| PipelineError::InputInvalid("non-UTF8 frames path".to_string()))?;

    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error"]);
    if tolerant {
        cmd.args(["-err_detect", "ignore_err", "-fflags", "+genpts+igndts"]);
    }
    let filter = format!("fps=1/{interval_sec}");
    cmd.args(["-i", video_path_str, "-vf", &filter, "-q:v", "2", output_pattern_str]);

    debug!("Running ffmpeg extraction (tolerant={tolerant})");
    let output = cmd
        .output()
        .map_err(|e| PipelineError::ExtractionFailed(format!("failed to execute ffmpeg: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::ExtractionFailed(format!(
            "ffmpeg failed: {}",
            stderr.trim()
        )));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(frames_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|e| e.to_str()) == Some("jpg")
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.starts_with("frame_"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn clear_frames(frames_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(frames_dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jpg") {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_timestamps() {
        // into_record keeps explicit timestamps and dense indices
        let frame = SampledFrame {
            index: 3,
            timestamp_sec: 15.0,
            filename: "frame_000004.jpg".to_string(),
            path: PathBuf::from("/tmp/frame_000004.jpg"),
        };
        let record = frame.into_record();
        assert_eq!(record.frame_index, 3);
        assert_eq!(record.timestamp_sec, 15.0);
        assert!(record.detections.is_empty());
    }

    // Requires ffmpeg and a real media file; exercised by the validation
    // environment rather than unit CI.
    #[test]
    #[ignore]
    fn test_extract_from_real_video() {
        let dir = tempfile::TempDir::new().unwrap();
        let sampling = SamplingOptions::disabled();
        let frames = extract_frames(
            Path::new("testdata/sample.mp4"),
            dir.path(),
            5,
            &sampling,
        )
        .unwrap();
        assert!(!frames.is_empty());
        assert_eq!(frames[0].timestamp_sec, 0.0);
    }
}
