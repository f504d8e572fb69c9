//! Persisted file layout under the data root
//!
//! ```text
//! <root>/
//!   state.db
//!   videos/<video_id>/video.<ext>
//!   frames/<video_id>/frame_<NNNNNN>.jpg
//!   frames/<video_id>/annotated/frame_<NNNNNN>.jpg
//!   frames/<video_id>/frames.json
//!   reports/<video_id>/report.json
//!   reports/<video_id>/transcript.json
//! ```
//!
//! The per-job directories are owned exclusively by the worker processing
//! that job; the facade only ever reads committed artifacts.

use entity_index_common::{PipelineError, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolver for every per-job path
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the top-level directory skeleton
    pub fn ensure_root_dirs(&self) -> Result<()> {
        for dir in ["videos", "frames", "reports"] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.root.join("videos").join(video_id)
    }

    #[must_use]
    pub fn frames_dir(&self, video_id: &str) -> PathBuf {
        self.root.join("frames").join(video_id)
    }

    #[must_use]
    pub fn annotated_dir(&self, video_id: &str) -> PathBuf {
        self.frames_dir(video_id).join("annotated")
    }

    #[must_use]
    pub fn reports_dir(&self, video_id: &str) -> PathBuf {
        self.root.join("reports").join(video_id)
    }

    #[must_use]
    pub fn frames_index_path(&self, video_id: &str) -> PathBuf {
        self.frames_dir(video_id).join("frames.json")
    }

    #[must_use]
    pub fn report_path(&self, video_id: &str) -> PathBuf {
        self.reports_dir(video_id).join("report.json")
    }

    #[must_use]
    pub fn transcript_path(&self, video_id: &str) -> PathBuf {
        self.reports_dir(video_id).join("transcript.json")
    }

    /// Zero-padded ordinal frame filename; ordinals start at 1 to match the
    /// extractor's output numbering
    #[must_use]
    pub fn frame_filename(ordinal: usize) -> String {
        format!("frame_{ordinal:06}.jpg")
    }

    /// Remove every artifact directory belonging to a job. Missing
    /// directories are not an error (partial jobs, repeated deletes).
    pub fn remove_job_artifacts(&self, video_id: &str) -> Result<()> {
        for dir in [
            self.video_dir(video_id),
            self.frames_dir(video_id),
            self.reports_dir(video_id),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

/// Write a JSON artifact atomically: serialize to a temp file in the target
/// directory, then rename over the destination so a concurrent reader never
/// observes a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::Persistence(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact.json")
    ));
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.frames_index_path("ab12cd34"),
            PathBuf::from("/data/frames/ab12cd34/frames.json")
        );
        assert_eq!(
            layout.report_path("ab12cd34"),
            PathBuf::from("/data/reports/ab12cd34/report.json")
        );
        assert_eq!(DataLayout::frame_filename(7), "frame_000007.jpg");
    }

    #[test]
    fn test_atomic_write_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.ensure_root_dirs().unwrap();

        let path = layout.report_path("ab12cd34");
        write_json_atomic(&path, &json!({"ok": true})).unwrap();
        assert!(path.exists());
        // No temp file left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        layout.remove_job_artifacts("ab12cd34").unwrap();
        assert!(!path.exists());
        // Deleting again is fine
        layout.remove_job_artifacts("ab12cd34").unwrap();
    }
}
