//! Smart sampling: prune a uniform frame grid by pixel-difference similarity
//!
//! Two successive samples whose normalized grayscale difference falls below
//! the threshold collapse to the earlier representative. A minimum number of
//! frames is always retained; when pruning would go below it the full grid is
//! kept (near-static videos still get their floor of samples).

use crate::SampledFrame;
use entity_index_common::Result;
use image::imageops::FilterType;
use image::GrayImage;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Comparison resolution; differencing does not need full frames
const DIFF_SIZE: u32 = 160;

/// Smart sampling parameters
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    pub enabled: bool,
    /// Normalized difference below which two samples are considered the same
    /// scene (0-1 scale)
    pub diff_threshold: f64,
    /// Floor on retained frames
    pub min_keep: usize,
}

impl SamplingOptions {
    #[must_use]
    pub fn new(enabled: bool, diff_threshold: f64, min_keep: usize) -> Self {
        Self {
            enabled,
            diff_threshold,
            min_keep,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(false, 0.06, 6)
    }
}

/// Mean absolute grayscale difference on a 0-1 scale
fn frame_difference(a: &GrayImage, b: &GrayImage) -> f64 {
    let total: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| u64::from(pa[0].abs_diff(pb[0])))
        .sum();
    let count = (a.width() * a.height()) as f64;
    total as f64 / count / 255.0
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    let img = image::open(path)
        .map_err(|e| entity_index_common::PipelineError::Other(format!(
            "failed to read frame {}: {e}",
            path.display()
        )))?;
    Ok(image::imageops::resize(&img.to_luma8(), DIFF_SIZE, DIFF_SIZE, FilterType::Triangle))
}

/// Prune near-identical successive samples, delete the dropped images, and
/// re-index the survivors densely. Timestamps are preserved.
pub fn prune_similar(grid: Vec<SampledFrame>, options: &SamplingOptions) -> Result<Vec<SampledFrame>> {
    if grid.len() <= 1 {
        return Ok(grid);
    }

    let mut kept: Vec<usize> = Vec::with_capacity(grid.len());
    let mut prev_gray: Option<GrayImage> = None;

    for (i, frame) in grid.iter().enumerate() {
        let gray = load_gray(&frame.path)?;
        match &prev_gray {
            None => {
                kept.push(i);
                prev_gray = Some(gray);
            }
            Some(prev) => {
                let score = frame_difference(prev, &gray);
                if score >= options.diff_threshold {
                    kept.push(i);
                    prev_gray = Some(gray);
                }
            }
        }
    }

    if kept.len() < options.min_keep.max(1) {
        debug!(
            "Smart sampling kept {} < floor {}, retaining full grid",
            kept.len(),
            options.min_keep
        );
        return Ok(grid);
    }

    let kept_set: std::collections::HashSet<usize> = kept.iter().copied().collect();
    let mut survivors = Vec::with_capacity(kept.len());
    for (i, frame) in grid.into_iter().enumerate() {
        if kept_set.contains(&i) {
            let index = survivors.len();
            survivors.push(SampledFrame { index, ..frame });
        } else {
            // Dropped samples leave no orphan images behind
            let _ = fs::remove_file(&frame.path);
        }
    }
    Ok(survivors)
}
