//! Report assembler
//!
//! Persists the canonical report and frames index atomically (temp file +
//! rename, so the facade's report reads never observe a torn file) and
//! renders bounding-box overlays for frames whose detections survived
//! aggregation. Detections without a box (discovery, box-less OCR) stay in
//! the report but are omitted from the overlay.

use entity_index_common::{EntitySummary, FrameRecord, FramesIndex, Report, Result};
use entity_index_core::{write_json_atomic, DataLayout};
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::collections::BTreeMap;
use std::fs;
use tracing::{debug, info, warn};

/// Overlay accent color
const BOX_COLOR: Rgb<u8> = Rgb([195, 134, 0]);

/// Write the canonical report artifact
pub fn persist_report(layout: &DataLayout, video_id: &str, report: &Report) -> Result<()> {
    let path = layout.report_path(video_id);
    write_json_atomic(&path, report)?;
    info!(
        "Report for {} written: {} entities over {} frames",
        video_id, report.unique_entities, report.frames_analyzed
    );
    Ok(())
}

/// Write the transcript artifact next to the report
pub fn persist_transcript(
    layout: &DataLayout,
    video_id: &str,
    transcript: &entity_index_common::Transcript,
) -> Result<()> {
    write_json_atomic(&layout.transcript_path(video_id), transcript)
}

/// Write the `(index, timestamp, filename, detections)` mapping
pub fn persist_frames_index(
    layout: &DataLayout,
    video_id: &str,
    frames: &[FrameRecord],
) -> Result<()> {
    let index = FramesIndex {
        frames: frames.to_vec(),
    };
    write_json_atomic(&layout.frames_index_path(video_id), &index)
}

/// Draw overlays for every frame with at least one surviving detection and
/// record the annotated filename on the frame.
///
/// `entities` is the post-aggregation map: detections whose label was
/// filtered out of the report draw nothing.
pub fn render_annotations(
    layout: &DataLayout,
    video_id: &str,
    frames: &mut [FrameRecord],
    entities: &BTreeMap<String, EntitySummary>,
) -> Result<()> {
    let frames_dir = layout.frames_dir(video_id);
    let annotated_dir = layout.annotated_dir(video_id);
    fs::create_dir_all(&annotated_dir)?;

    let mut rendered = 0usize;
    for frame in frames.iter_mut() {
        let surviving: Vec<_> = frame
            .detections
            .iter()
            .filter(|d| entities.contains_key(&d.label))
            .collect();
        if surviving.is_empty() {
            continue;
        }

        let source_path = frames_dir.join(&frame.filename);
        let mut img = match image::open(&source_path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!("Skipping overlay for {}: {e}", source_path.display());
                continue;
            }
        };

        for det in &surviving {
            let Some(bbox) = det.bbox else {
                continue;
            };
            if bbox.w < 1.0 || bbox.h < 1.0 {
                continue;
            }
            let rect = Rect::at(bbox.x as i32, bbox.y as i32)
                .of_size(bbox.w.max(1.0) as u32, bbox.h.max(1.0) as u32);
            draw_hollow_rect_mut(&mut img, rect, BOX_COLOR);
        }

        let annotated_path = annotated_dir.join(&frame.filename);
        img.save(&annotated_path).map_err(|e| {
            entity_index_common::PipelineError::Persistence(format!(
                "failed to write overlay {}: {e}",
                annotated_path.display()
            ))
        })?;
        frame.annotated_filename = Some(format!("annotated/{}", frame.filename));
        rendered += 1;
    }

    debug!("Rendered {rendered} annotated frames for {video_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use entity_index_common::{BoundingBox, Detection, Source, TimeRange};
    use tempfile::TempDir;

    fn summary() -> EntitySummary {
        EntitySummary {
            count: 2,
            presence: 1.0,
            appearances: 2,
            time_ranges: vec![TimeRange::new(0.0, 5.0)],
            confidence_score: 0.655,
            sources: vec!["yolo".to_string()],
        }
    }

    fn write_source_frame(layout: &DataLayout, video_id: &str, filename: &str) {
        let dir = layout.frames_dir(video_id);
        fs::create_dir_all(&dir).unwrap();
        image::RgbImage::new(64, 64).save(dir.join(filename)).unwrap();
    }

    #[test]
    fn test_report_written_atomically_and_readable() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());

        let mut entities = BTreeMap::new();
        entities.insert("aircraft".to_string(), summary());
        let report = Report {
            video_id: "ab12cd34".to_string(),
            filename: "clip.mp4".to_string(),
            duration_sec: 10.0,
            interval_sec: 5,
            frames_analyzed: 2,
            unique_entities: 1,
            entities,
            transcript: None,
        };

        persist_report(&layout, "ab12cd34", &report).unwrap();
        let raw = fs::read_to_string(layout.report_path("ab12cd34")).unwrap();
        let parsed: Report = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.unique_entities, 1);
        assert!(parsed.entities.contains_key("aircraft"));
    }

    #[test]
    fn test_annotations_only_for_surviving_detections() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let video_id = "ab12cd34";
        write_source_frame(&layout, video_id, "frame_000001.jpg");
        write_source_frame(&layout, video_id, "frame_000002.jpg");

        let mut boxed = Detection::new("aircraft", Source::Yolo, 0.9);
        boxed.bbox = Some(BoundingBox::new(4.0, 4.0, 20.0, 20.0));
        let filtered_out = Detection::new("smudge", Source::Yolo, 0.9);

        let mut frames = vec![
            FrameRecord {
                frame_index: 0,
                timestamp_sec: 0.0,
                filename: "frame_000001.jpg".to_string(),
                annotated_filename: None,
                detections: vec![boxed],
                errors: Vec::new(),
            },
            FrameRecord {
                frame_index: 1,
                timestamp_sec: 5.0,
                filename: "frame_000002.jpg".to_string(),
                annotated_filename: None,
                detections: vec![filtered_out],
                errors: Vec::new(),
            },
        ];

        let mut entities = BTreeMap::new();
        entities.insert("aircraft".to_string(), summary());

        render_annotations(&layout, video_id, &mut frames, &entities).unwrap();

        // Frame 0 has a surviving detection -> overlay exists
        assert_eq!(
            frames[0].annotated_filename.as_deref(),
            Some("annotated/frame_000001.jpg")
        );
        assert!(layout.annotated_dir(video_id).join("frame_000001.jpg").exists());

        // Frame 1's only label was dropped by aggregation -> no overlay
        assert!(frames[1].annotated_filename.is_none());
        assert!(!layout.annotated_dir(video_id).join("frame_000002.jpg").exists());
    }

    #[test]
    fn test_frames_index_round_trip() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let frames = vec![FrameRecord {
            frame_index: 0,
            timestamp_sec: 0.0,
            filename: "frame_000001.jpg".to_string(),
            annotated_filename: None,
            detections: vec![Detection::new("tank", Source::Yolo, 0.8)],
            errors: Vec::new(),
        }];

        persist_frames_index(&layout, "ab12cd34", &frames).unwrap();
        let raw = fs::read_to_string(layout.frames_index_path("ab12cd34")).unwrap();
        let parsed: FramesIndex = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.frames.len(), 1);
        assert_eq!(parsed.frames[0].detections[0].label, "tank");
    }
}
