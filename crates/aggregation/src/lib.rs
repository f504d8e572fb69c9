//! Temporal aggregator
//!
//! Folds the ordered per-frame detection lists into the report's entity map.
//! This is a pure function of `(frames, options)`: re-running it over the
//! persisted frames.json yields a byte-identical result. Label iteration is
//! ordered (BTreeMap) and every tie breaks on the label string.
//!
//! Per label, the pipeline is: per-source occurrence vectors, cadence-aware
//! consecutive-run filtering, union into the final occurrence set, time-range
//! construction over maximal runs, and the weighted confidence score.

use entity_index_common::{
    round1, round4, Detection, EntitySummary, FrameRecord, Report, Source, TimeRange, Transcript,
};
use std::collections::{BTreeMap, BTreeSet};

/// Aggregation tuning, a subset of the worker configuration
#[derive(Debug, Clone)]
pub struct AggregationOptions {
    /// Run floor for yolo/verify/ocr occurrences
    pub min_consecutive: usize,
    pub open_vocab_min_consecutive: usize,
    pub discovery_min_consecutive: usize,
    /// Labels scoring below this are dropped from the report
    pub confidence_min_score: f64,
    /// When on, labels whose only contributor is `discovery` are dropped
    /// (unconfirmed candidates)
    pub verify_enabled: bool,

    pub discovery_every_n: usize,
    pub open_vocab_every_n: usize,
    pub verify_every_n: usize,
    pub ocr_every_n: usize,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            min_consecutive: 2,
            open_vocab_min_consecutive: 1,
            discovery_min_consecutive: 1,
            confidence_min_score: 0.1,
            verify_enabled: true,
            discovery_every_n: 1,
            open_vocab_every_n: 1,
            verify_every_n: 3,
            ocr_every_n: 4,
        }
    }
}

impl AggregationOptions {
    fn min_consecutive_for(&self, source: Source) -> usize {
        match source {
            Source::OpenVocab => self.open_vocab_min_consecutive,
            Source::Discovery => self.discovery_min_consecutive,
            Source::Yolo | Source::Verify | Source::Ocr => self.min_consecutive,
        }
    }

    fn cadence_for(&self, source: Source) -> usize {
        let n = match source {
            Source::Yolo => 1,
            Source::Discovery => self.discovery_every_n,
            Source::OpenVocab => self.open_vocab_every_n,
            Source::Verify => self.verify_every_n,
            Source::Ocr => self.ocr_every_n,
        };
        n.max(1)
    }
}

/// Aggregate the ordered frame sequence into the entity map
#[must_use]
pub fn aggregate(
    frames: &[FrameRecord],
    options: &AggregationOptions,
) -> BTreeMap<String, EntitySummary> {
    let frames_analyzed = frames.len();
    if frames_analyzed == 0 {
        return BTreeMap::new();
    }

    // label -> source -> occurrence frame indices
    let mut occurrences: BTreeMap<String, BTreeMap<Source, BTreeSet<usize>>> = BTreeMap::new();
    for (i, frame) in frames.iter().enumerate() {
        for det in &frame.detections {
            if det.label.is_empty() {
                continue;
            }
            occurrences
                .entry(det.label.clone())
                .or_default()
                .entry(det.source)
                .or_default()
                .insert(i);
        }
    }

    let mut entities = BTreeMap::new();
    for (label, by_source) in occurrences {
        // Per-source consecutive filtering over eligible ordinals, then
        // union of the survivors
        let mut kept: BTreeSet<usize> = BTreeSet::new();
        let mut contributors: BTreeSet<Source> = BTreeSet::new();
        for (&source, indices) in &by_source {
            let survivors = filter_consecutive(
                indices,
                options.cadence_for(source),
                options.min_consecutive_for(source),
            );
            if !survivors.is_empty() {
                contributors.insert(source);
                kept.extend(survivors);
            }
        }
        if kept.is_empty() {
            continue;
        }

        // Unconfirmed discovery candidates do not reach the report
        if options.verify_enabled
            && contributors.len() == 1
            && contributors.contains(&Source::Discovery)
        {
            continue;
        }

        let appearances = kept.len();
        let count = frames
            .iter()
            .enumerate()
            .filter(|(i, _)| kept.contains(i))
            .map(|(_, f)| f.detections.iter().filter(|d| d.label == label).count())
            .sum();

        let surviving: Vec<&Detection> = frames
            .iter()
            .enumerate()
            .filter(|(i, _)| kept.contains(i))
            .flat_map(|(_, f)| f.detections.iter().filter(|d| d.label == label))
            .collect();

        let runs = maximal_runs(&kept);
        let time_ranges: Vec<TimeRange> = runs
            .iter()
            .map(|&(first, last)| {
                TimeRange::new(
                    round1(frames[first].timestamp_sec),
                    round1(frames[last].timestamp_sec),
                )
            })
            .collect();

        let confidence_score =
            confidence_score(&surviving, &contributors, &runs, appearances);
        if confidence_score < options.confidence_min_score {
            continue;
        }

        entities.insert(
            label,
            EntitySummary {
                count,
                presence: round4(appearances as f64 / frames_analyzed as f64),
                appearances,
                time_ranges,
                confidence_score,
                sources: contributors.iter().map(|s| s.as_str().to_string()).collect(),
            },
        );
    }
    entities
}

/// Assemble the canonical report from the aggregated entities
#[must_use]
pub fn build_report(
    video_id: &str,
    filename: &str,
    duration_sec: f64,
    interval_sec: u32,
    frames: &[FrameRecord],
    transcript: Option<Transcript>,
    options: &AggregationOptions,
) -> Report {
    let entities = aggregate(frames, options);
    Report {
        video_id: video_id.to_string(),
        filename: filename.to_string(),
        duration_sec: round1(duration_sec),
        interval_sec,
        frames_analyzed: frames.len(),
        unique_entities: entities.len(),
        entities,
        transcript,
    }
}

/// Keep only occurrences belonging to runs of at least `min_consecutive`
/// successive *eligible* frames. Eligibility follows the source cadence: a
/// source due every `n` frames has eligible ordinals `k / n`, so a gap in
/// ordinals means the source genuinely stopped seeing the label, not that it
/// was never asked.
fn filter_consecutive(
    indices: &BTreeSet<usize>,
    every_n: usize,
    min_consecutive: usize,
) -> Vec<usize> {
    if indices.is_empty() {
        return Vec::new();
    }
    if min_consecutive <= 1 {
        return indices.iter().copied().collect();
    }

    // Map frame index -> eligible ordinal (off-cadence strays keep their
    // frame index, which only makes runs harder to form)
    let ordinals: Vec<(usize, usize)> = indices
        .iter()
        .map(|&i| {
            let ordinal = if i % every_n == 0 { i / every_n } else { i };
            (ordinal, i)
        })
        .collect();

    let mut kept = Vec::new();
    let mut run: Vec<usize> = vec![ordinals[0].1];
    let mut last_ordinal = ordinals[0].0;
    for &(ordinal, frame_idx) in &ordinals[1..] {
        if ordinal == last_ordinal + 1 {
            run.push(frame_idx);
        } else {
            if run.len() >= min_consecutive {
                kept.extend(run.iter().copied());
            }
            run = vec![frame_idx];
        }
        last_ordinal = ordinal;
    }
    if run.len() >= min_consecutive {
        kept.extend(run);
    }
    kept
}

/// Maximal runs of consecutive frame indices as (first, last) pairs
fn maximal_runs(kept: &BTreeSet<usize>) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut iter = kept.iter().copied();
    let Some(mut start) = iter.next() else {
        return runs;
    };
    let mut prev = start;
    for i in iter {
        if i != prev + 1 {
            runs.push((start, prev));
            start = i;
        }
        prev = i;
    }
    runs.push((start, prev));
    runs
}

/// Weighted evidence score:
/// `0.45 * mean(confidences) + 0.25 * source_diversity
///  + 0.20 * consistency_ratio + 0.10 * ocr_evidence`
fn confidence_score(
    surviving: &[&Detection],
    contributors: &BTreeSet<Source>,
    runs: &[(usize, usize)],
    appearances: usize,
) -> f64 {
    let mean_confidence = if surviving.is_empty() {
        0.0
    } else {
        surviving.iter().map(|d| f64::from(d.confidence)).sum::<f64>() / surviving.len() as f64
    };
    let source_diversity = contributors.len() as f64 / Source::COUNT as f64;
    let longest_run = runs
        .iter()
        .map(|&(first, last)| last - first + 1)
        .max()
        .unwrap_or(0);
    let consistency_ratio = if appearances > 0 {
        longest_run as f64 / appearances as f64
    } else {
        0.0
    };
    let ocr_evidence = if contributors.contains(&Source::Ocr) {
        1.0
    } else {
        0.0
    };

    let score = 0.45 * mean_confidence
        + 0.25 * source_diversity
        + 0.20 * consistency_ratio
        + 0.10 * ocr_evidence;
    round4(score.clamp(0.0, 1.0))
}
