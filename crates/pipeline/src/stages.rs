//! Stage driver
//!
//! Walks one job through the ordered stage list, each stage owning a slice
//! of the progress range:
//!
//! | stage | progress | failure policy |
//! |---|---|---|
//! | `extracting_frames`  | 0 -> 20  | fatal |
//! | `transcribing_audio` | 20       | non-fatal, error recorded on the transcript |
//! | `detecting_entities` | 20 -> 80 | per-source failures non-fatal |
//! | `aggregating_report` | 80 -> 95 | fatal |
//! | `indexing_search`    | 95 -> 100| non-fatal |
//!
//! Progress writes are debounced to one per 250ms or per 5 frames. Every
//! stage runs under its soft time budget; cancellation is honored at stage
//! and frame boundaries.

use crate::harness::ProcessingHarness;
use crate::PipelineContext;
use entity_index_aggregation::build_report;
use entity_index_common::{
    FrameRecord, Job, JobStatus, PipelineError, Result, Transcript,
};
use entity_index_detectors::FusionEngine;
use entity_index_store::StoreError;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STAGE_EXTRACT: &str = "extracting_frames";
const STAGE_TRANSCRIBE: &str = "transcribing_audio";
const STAGE_DETECT: &str = "detecting_entities";
const STAGE_AGGREGATE: &str = "aggregating_report";
const STAGE_INDEX: &str = "indexing_search";

const PROGRESS_DEBOUNCE: Duration = Duration::from_millis(250);
const PROGRESS_FRAME_STRIDE: usize = 5;

/// Drives one job at a time through the pipeline stages
pub struct StageDriver {
    ctx: Arc<PipelineContext>,
    harness: Arc<ProcessingHarness>,
}

impl StageDriver {
    #[must_use]
    pub fn new(ctx: Arc<PipelineContext>, harness: Arc<ProcessingHarness>) -> Self {
        Self { ctx, harness }
    }

    /// Process one task end to end. Redelivered tasks whose job is already
    /// terminal are acknowledged without work.
    pub async fn run_job(&self, video_id: &str) {
        let job = match self.ctx.store.get(video_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!("Task for unknown job {video_id}, dropping");
                return;
            }
            Err(e) => {
                error!("Store read failed for {video_id}: {e}");
                return;
            }
        };
        if job.status.is_terminal() {
            info!("Job {video_id} already {}, acknowledging", job.status.as_str());
            return;
        }

        let token = self.ctx.cancellations.register(video_id);
        let outcome = self.execute(&job, &token).await;
        self.ctx.cancellations.remove(video_id);

        if let Err(e) = outcome {
            let message = e.to_string();
            error!("Job {video_id} failed: {message}");
            if let Err(store_err) = self.ctx.store.finish_failed(video_id, &message).await {
                error!("Could not record failure for {video_id}: {store_err}");
            }
            self.discard_partial_artifacts(video_id);
        }
    }

    async fn execute(&self, job: &Job, token: &CancellationToken) -> Result<()> {
        let video_id = job.video_id.clone();
        let video_path = std::path::PathBuf::from(
            job.original_path
                .as_deref()
                .ok_or_else(|| PipelineError::InputInvalid("job has no stored video".to_string()))?,
        );
        if !video_path.exists() {
            return Err(PipelineError::InputInvalid(format!(
                "stored video missing at {}",
                video_path.display()
            )));
        }

        // --- extracting_frames: 0 -> 20, fatal ------------------------------
        self.update(&video_id, 1.0, STAGE_EXTRACT, None).await?;
        let interval_sec = job.interval_sec;
        let frames_dir = self.ctx.layout.frames_dir(&video_id);
        let (duration_sec, mut records) = self
            .stage_timeout(STAGE_EXTRACT, self.extract_stage(&video_path, &frames_dir, interval_sec))
            .await?;
        ensure_live(token)?;

        self.ctx
            .store
            .update_media(
                &video_id,
                duration_sec,
                records.len() as i64,
                &frames_dir.display().to_string(),
            )
            .await
            .map_err(persist_err)?;
        entity_index_report::persist_frames_index(&self.ctx.layout, &video_id, &records)?;
        self.update(
            &video_id,
            20.0,
            STAGE_EXTRACT,
            Some(&format!("{} frames extracted", records.len())),
        )
        .await?;

        // --- transcribing_audio: point update at 20, non-fatal --------------
        self.update(&video_id, 20.0, STAGE_TRANSCRIBE, None).await?;
        let transcript = self
            .stage_timeout(
                STAGE_TRANSCRIBE,
                async { Ok(self.transcribe_stage(job, &video_path, duration_sec).await) },
            )
            .await
            .unwrap_or_else(|_| {
                Some(transcript_error("transcription timed out", duration_sec))
            });
        if let Some(t) = &transcript {
            entity_index_report::persist_transcript(&self.ctx.layout, &video_id, t)?;
        }
        ensure_live(token)?;

        // --- detecting_entities: 20 -> 80, per-source failures non-fatal ----
        self.update(&video_id, 20.0, STAGE_DETECT, None).await?;
        self.stage_timeout(
            STAGE_DETECT,
            self.detect_stage(&video_id, &frames_dir, &mut records, token),
        )
        .await?;

        // --- aggregating_report: 80 -> 95, fatal ----------------------------
        self.update(&video_id, 80.0, STAGE_AGGREGATE, None).await?;
        ensure_live(token)?;
        let report = self
            .stage_timeout(
                STAGE_AGGREGATE,
                self.aggregate_stage(job, duration_sec, &mut records, transcript),
            )
            .await?;
        self.update(&video_id, 95.0, STAGE_AGGREGATE, None).await?;

        // --- indexing_search: 95 -> 100, non-fatal --------------------------
        self.update(&video_id, 95.0, STAGE_INDEX, None).await?;
        let entities_json = serde_json::to_string(&report.entities)?;
        self.ctx
            .store
            .finish_completed(
                &video_id,
                report.unique_entities as i64,
                &entities_json,
                &self.ctx.layout.report_path(&video_id).display().to_string(),
            )
            .await
            .map_err(persist_err)?;
        match self.ctx.store.get(&video_id).await {
            Ok(completed) => self.ctx.search.upsert_job(&completed, &report.entities),
            Err(e) => warn!("Search indexing skipped for {video_id}: {e}"),
        }

        info!(
            "Job {video_id} completed: {} entities over {} frames",
            report.unique_entities, report.frames_analyzed
        );
        Ok(())
    }

    /// Probe duration and run both extraction paths off the async runtime
    fn extract_stage(
        &self,
        video_path: &std::path::Path,
        frames_dir: &std::path::Path,
        interval_sec: u32,
    ) -> impl Future<Output = Result<(f64, Vec<FrameRecord>)>> {
        let frame_source = self.harness.frame_source.clone();
        let sampling = self.harness.sampling.clone();
        let video_path = video_path.to_path_buf();
        let frames_dir = frames_dir.to_path_buf();
        async move {
            let joined = spawn_blocking(move || {
                let duration = frame_source.probe_duration(&video_path)?;
                let frames =
                    frame_source.extract(&video_path, &frames_dir, interval_sec, &sampling)?;
                Ok::<_, PipelineError>((duration, frames))
            })
            .await
            .map_err(|e| PipelineError::Other(format!("extraction task panicked: {e}")))?;
            let (duration, frames) = joined?;
            let records: Vec<FrameRecord> =
                frames.into_iter().map(|f| f.into_record()).collect();
            Ok((duration, records))
        }
    }

    /// Companion voice file wins over the speech model; a missing
    /// transcriber capability skips the stage entirely.
    async fn transcribe_stage(
        &self,
        job: &Job,
        video_path: &std::path::Path,
        duration_sec: f64,
    ) -> Option<Transcript> {
        if let Some(voice_path) = &job.voice_path {
            match tokio::fs::read_to_string(voice_path).await {
                Ok(text) => {
                    return Some(entity_index_transcription::transcript_from_voice_file(
                        &text,
                        duration_sec,
                    ))
                }
                Err(e) => {
                    warn!("Voice file unreadable for {}: {e}", job.video_id);
                    return Some(transcript_error(
                        &format!("voice file unreadable: {e}"),
                        duration_sec,
                    ));
                }
            }
        }

        let transcriber = self.harness.transcriber.clone()?;
        let video_path = video_path.to_path_buf();
        let joined = spawn_blocking(move || {
            let mut guard = transcriber
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.transcribe(&video_path, duration_sec)
        })
        .await;

        match joined {
            Ok(Ok(transcript)) => Some(transcript),
            Ok(Err(e)) => Some(transcript_error(&e.to_string(), duration_sec)),
            Err(e) => Some(transcript_error(
                &format!("transcription task panicked: {e}"),
                duration_sec,
            )),
        }
    }

    /// Fuse all due sources over every frame, in ascending timestamp order
    async fn detect_stage(
        &self,
        video_id: &str,
        frames_dir: &std::path::Path,
        records: &mut [FrameRecord],
        token: &CancellationToken,
    ) -> Result<()> {
        let total = records.len();
        let engine = Arc::new(Mutex::new(FusionEngine::new(self.harness.fusion.clone())));
        let mut gate = ProgressGate::new();

        for (k, record) in records.iter_mut().enumerate() {
            ensure_live(token)?;

            let image_path = frames_dir.join(&record.filename);
            let detectors = self.harness.detectors.clone();
            let engine = engine.clone();
            let joined = spawn_blocking(move || {
                let image = image::open(&image_path)
                    .map_err(|e| {
                        PipelineError::CapabilityRuntime(format!(
                            "undecodable frame {}: {e}",
                            image_path.display()
                        ))
                    })?
                    .to_rgb8();
                let mut engine = engine
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                Ok::<_, PipelineError>(engine.process_frame(&detectors, k, &image))
            })
            .await
            .map_err(|e| PipelineError::Other(format!("detection task panicked: {e}")))?;

            match joined {
                Ok(outcome) => {
                    record.detections = outcome.detections;
                    record.errors = outcome.errors;
                }
                Err(e) => {
                    // An undecodable frame is a per-frame event, not a job killer
                    record.errors.push(e.to_string());
                }
            }

            if gate.should_write(k + 1 == total) {
                let progress = 20.0 + 60.0 * (k + 1) as f64 / total.max(1) as f64;
                self.update(
                    video_id,
                    progress,
                    STAGE_DETECT,
                    Some(&format!("frame {}/{}", k + 1, total)),
                )
                .await?;
            }
        }

        let engine = engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.harness.detectors.yolo.is_some() && engine.yolo_failed_on_every_frame() {
            return Err(PipelineError::CapabilityRuntime(
                "object detection failed on every frame".to_string(),
            ));
        }
        Ok(())
    }

    /// Aggregate, annotate, and persist the canonical artifacts
    async fn aggregate_stage(
        &self,
        job: &Job,
        duration_sec: f64,
        records: &mut Vec<FrameRecord>,
        transcript: Option<Transcript>,
    ) -> Result<entity_index_common::Report> {
        let report = build_report(
            &job.video_id,
            &job.filename,
            duration_sec,
            job.interval_sec,
            records,
            transcript,
            &self.harness.aggregation,
        );

        if self.harness.annotate_frames && !report.entities.is_empty() {
            let layout = self.ctx.layout.clone();
            let video_id = job.video_id.clone();
            let entities = report.entities.clone();
            let mut owned = std::mem::take(records);
            let annotated = spawn_blocking(move || {
                entity_index_report::render_annotations(&layout, &video_id, &mut owned, &entities)
                    .map(|()| owned)
            })
            .await
            .map_err(|e| PipelineError::Other(format!("annotation task panicked: {e}")))??;
            *records = annotated;
        }

        entity_index_report::persist_frames_index(&self.ctx.layout, &job.video_id, records)?;
        entity_index_report::persist_report(&self.ctx.layout, &job.video_id, &report)?;
        Ok(report)
    }

    async fn stage_timeout<T>(
        &self,
        stage: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(self.ctx.config.stage_timeouts.for_stage(stage), fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::StageTimeout(stage.to_string())),
        }
    }

    async fn update(
        &self,
        video_id: &str,
        progress: f64,
        stage: &str,
        status_text: Option<&str>,
    ) -> Result<()> {
        self.ctx
            .store
            .update_status(video_id, JobStatus::Processing, progress, stage, status_text)
            .await
            .map_err(persist_err)
    }

    /// Failed and cancelled jobs leave no frames or reports behind; the
    /// stored video stays for inspection until the job is deleted.
    fn discard_partial_artifacts(&self, video_id: &str) {
        for dir in [
            self.ctx.layout.frames_dir(video_id),
            self.ctx.layout.reports_dir(video_id),
        ] {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!("Could not remove {}: {e}", dir.display());
                }
            }
        }
    }
}

/// Write throttle for detection progress
struct ProgressGate {
    last_write: Instant,
    frames_since: usize,
}

impl ProgressGate {
    fn new() -> Self {
        Self {
            last_write: Instant::now(),
            frames_since: 0,
        }
    }

    fn should_write(&mut self, force: bool) -> bool {
        self.frames_since += 1;
        if force
            || self.frames_since >= PROGRESS_FRAME_STRIDE
            || self.last_write.elapsed() >= PROGRESS_DEBOUNCE
        {
            self.frames_since = 0;
            self.last_write = Instant::now();
            true
        } else {
            false
        }
    }
}

fn ensure_live(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn persist_err(e: StoreError) -> PipelineError {
    PipelineError::Persistence(e.to_string())
}

fn transcript_error(message: &str, duration_sec: f64) -> Transcript {
    Transcript {
        language: "unknown".to_string(),
        text: String::new(),
        segments: Vec::new(),
        audio_analysis: Some(entity_index_transcription::analyze_segments(
            &[],
            duration_sec,
            false,
        )),
        error: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_gate_stride() {
        let mut gate = ProgressGate::new();
        // Not yet at the stride, not forced, well under the debounce window
        assert!(!gate.should_write(false));
        assert!(!gate.should_write(false));
        assert!(!gate.should_write(false));
        assert!(!gate.should_write(false));
        // Fifth frame hits the stride
        assert!(gate.should_write(false));
    }

    #[test]
    fn test_progress_gate_forced_on_last_frame() {
        let mut gate = ProgressGate::new();
        assert!(gate.should_write(true));
    }

    #[test]
    fn test_cancellation_guard() {
        let token = CancellationToken::new();
        assert!(ensure_live(&token).is_ok());
        token.cancel();
        let err = ensure_live(&token).unwrap_err();
        assert_eq!(err.to_string(), "cancelled");
    }
}
