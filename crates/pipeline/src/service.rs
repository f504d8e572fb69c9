//! Job service: the operation surface the facade consumes
//!
//! Submission enqueues and returns; everything else reads committed state.
//! No operation here ever reaches into a running job's directory except
//! delete, which owns the whole lifecycle of the artifacts it removes.

use crate::PipelineContext;
use entity_index_broker::{Broker, BrokerError, ProcessTask};
use entity_index_common::{
    FramesIndex, Job, JobStatus, PipelineError, Report, Result,
};
use entity_index_search::{SearchQuery, SearchResponse};
use entity_index_store::StoreError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Submission inputs after the fetcher/upload handling stored the bytes
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub filename: String,
    pub interval_sec: Option<u32>,
    /// Already-stored video path under `videos/<tmp>/`; the service moves it
    /// into place once the job id exists
    pub staged_video: std::path::PathBuf,
    pub staged_voice: Option<std::path::PathBuf>,
}

/// Poll-friendly status projection
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub video_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_stage: Option<String>,
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One page of frame records
#[derive(Debug, Clone, Serialize)]
pub struct FramesPage {
    pub page: u32,
    pub page_size: u32,
    pub total: usize,
    pub frames: Vec<entity_index_common::FrameRecord>,
}

/// Position of the frame closest to a timestamp
#[derive(Debug, Clone, Serialize)]
pub struct NearestFrame {
    pub page: u32,
    pub frame_index: usize,
    pub timestamp_sec: f64,
}

/// The facade-facing service
pub struct JobService {
    ctx: Arc<PipelineContext>,
    broker: Arc<dyn Broker>,
}

impl JobService {
    #[must_use]
    pub fn new(ctx: Arc<PipelineContext>, broker: Arc<dyn Broker>) -> Self {
        Self { ctx, broker }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Create the job record in `queued` and enqueue the task. Never blocks
    /// on processing. A saturated queue undoes the record so backpressure is
    /// visible to the submitter and nothing is half-created.
    pub async fn create_job(&self, input: CreateJob) -> Result<String> {
        let interval_sec = self.ctx.config.clamp_interval(input.interval_sec);

        let video_id = self
            .ctx
            .store
            .submit(&input.filename, interval_sec, None, None)
            .await
            .map_err(store_err)?;

        // Move the staged upload into the job's own directory
        let video_dir = self.ctx.layout.video_dir(&video_id);
        std::fs::create_dir_all(&video_dir)?;
        let ext = input
            .staged_video
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4")
            .to_string();
        let video_path = video_dir.join(format!("video.{ext}"));
        move_file(&input.staged_video, &video_path)?;
        let voice_path = match &input.staged_voice {
            Some(staged) => {
                let dest = video_dir.join("voice.txt");
                move_file(staged, &dest)?;
                Some(dest)
            }
            None => None,
        };
        self.ctx
            .store
            .set_paths(
                &video_id,
                &video_path.display().to_string(),
                voice_path.as_deref().map(|p| p.display().to_string()).as_deref(),
            )
            .await
            .map_err(store_err)?;

        match self.broker.enqueue(ProcessTask::new(video_id.clone())).await {
            Ok(()) => {
                info!("Job {video_id} queued ({} @ {interval_sec}s)", input.filename);
                Ok(video_id)
            }
            Err(BrokerError::QueueFull) => {
                warn!("Queue full, rolling back job {video_id}");
                self.rollback_submission(&video_id).await;
                Err(PipelineError::Other(
                    "processing queue is full, retry later".to_string(),
                ))
            }
            Err(BrokerError::Closed) => {
                self.rollback_submission(&video_id).await;
                Err(PipelineError::Other("worker transport is down".to_string()))
            }
        }
    }

    pub async fn get_job(&self, video_id: &str) -> Result<Job> {
        self.ctx.store.get(video_id).await.map_err(store_err)
    }

    /// Safe to poll at 1-2 Hz; reads the durable row only
    pub async fn get_status(&self, video_id: &str) -> Result<StatusView> {
        let job = self.get_job(video_id).await?;
        Ok(StatusView {
            video_id: job.video_id,
            status: job.status,
            progress: job.progress,
            current_stage: job.current_stage,
            status_text: job.status_text,
            error: job.error,
        })
    }

    /// The canonical report; `NotReady` until the job completes
    pub async fn get_report(&self, video_id: &str) -> Result<Report> {
        let job = self.get_job(video_id).await?;
        if job.status != JobStatus::Completed {
            return Err(PipelineError::NotReady(video_id.to_string()));
        }
        let raw = std::fs::read_to_string(self.ctx.layout.report_path(video_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Job>, u64)> {
        self.ctx
            .store
            .list(status, page, page_size)
            .await
            .map_err(store_err)
    }

    /// Page through the persisted frames, optionally restricted to frames
    /// whose detections contain `entity`. Annotated and raw frames share the
    /// same filter semantics; `annotated` only switches which image the
    /// record points at.
    pub async fn list_frames(
        &self,
        video_id: &str,
        page: u32,
        page_size: u32,
        annotated: bool,
        entity: Option<&str>,
    ) -> Result<FramesPage> {
        let frames = self.filtered_frames(video_id, entity).await?;
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let total = frames.len();
        let start = ((page - 1) as usize) * page_size as usize;

        let mut page_frames: Vec<_> = frames
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        if annotated {
            for frame in page_frames.iter_mut() {
                if let Some(annotated_name) = frame.annotated_filename.clone() {
                    frame.filename = annotated_name;
                }
            }
        }
        Ok(FramesPage {
            page,
            page_size,
            total,
            frames: page_frames,
        })
    }

    /// The frame whose timestamp is closest to `timestamp_sec` (ties go to
    /// the earlier frame), with the page it lands on under `page_size`
    pub async fn nearest_frame(
        &self,
        video_id: &str,
        timestamp_sec: f64,
        page_size: u32,
        entity: Option<&str>,
    ) -> Result<NearestFrame> {
        let frames = self.filtered_frames(video_id, entity).await?;
        if frames.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "no frames match in job {video_id}"
            )));
        }

        let mut best_pos = 0usize;
        let mut best_distance = f64::INFINITY;
        for (pos, frame) in frames.iter().enumerate() {
            let distance = (frame.timestamp_sec - timestamp_sec).abs();
            // Strict less-than keeps the earlier frame on ties
            if distance < best_distance {
                best_distance = distance;
                best_pos = pos;
            }
        }

        let page_size = page_size.clamp(1, 100);
        Ok(NearestFrame {
            page: (best_pos / page_size as usize) as u32 + 1,
            frame_index: frames[best_pos].frame_index,
            timestamp_sec: frames[best_pos].timestamp_sec,
        })
    }

    /// Remove the record and every artifact. From the caller's perspective
    /// this is atomic: once the row is gone, a concurrent `get_job` is
    /// already not-found while the directories drain.
    pub async fn delete_job(&self, video_id: &str) -> Result<()> {
        let job = self
            .ctx
            .store
            .delete(video_id, self.ctx.config.stale_after)
            .await
            .map_err(store_err)?;
        self.ctx.search.remove_job(video_id);
        self.ctx.layout.remove_job_artifacts(video_id)?;
        info!("Deleted job {} ({})", video_id, job.filename);
        Ok(())
    }

    /// Request cooperative cancellation of a `processing` job
    pub async fn cancel_job(&self, video_id: &str) -> Result<()> {
        let job = self.get_job(video_id).await?;
        if job.status != JobStatus::Processing {
            return Err(PipelineError::Other(format!(
                "job {video_id} is {}, not processing",
                job.status.as_str()
            )));
        }
        if self.ctx.cancellations.cancel(video_id) {
            Ok(())
        } else {
            Err(PipelineError::Other(format!(
                "job {video_id} is not running on this worker"
            )))
        }
    }

    /// Entity search across all completed jobs
    #[must_use]
    pub fn search(&self, query: &SearchQuery) -> SearchResponse {
        self.ctx.search.query(query)
    }

    async fn filtered_frames(
        &self,
        video_id: &str,
        entity: Option<&str>,
    ) -> Result<Vec<entity_index_common::FrameRecord>> {
        // Guarantees not-found surfaces before a filesystem error
        let _job = self.get_job(video_id).await?;
        let path = self.ctx.layout.frames_index_path(video_id);
        if !path.exists() {
            return Err(PipelineError::NotReady(video_id.to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let index: FramesIndex = serde_json::from_str(&raw)?;

        let frames = match entity {
            Some(label) => index
                .frames
                .into_iter()
                .filter(|f| f.detections.iter().any(|d| d.label == label))
                .collect(),
            None => index.frames,
        };
        Ok(frames)
    }

    async fn rollback_submission(&self, video_id: &str) {
        if let Err(e) = self.ctx.store.delete(video_id, self.ctx.config.stale_after).await {
            warn!("Rollback of {video_id} failed: {e}");
        }
        if let Err(e) = self.ctx.layout.remove_job_artifacts(video_id) {
            warn!("Artifact rollback of {video_id} failed: {e}");
        }
    }
}

fn store_err(e: StoreError) -> PipelineError {
    match e {
        StoreError::NotFound(id) => PipelineError::NotFound(id),
        StoreError::DeleteForbidden(id) => {
            PipelineError::Other(format!("job {id} is still processing"))
        }
        other => PipelineError::Persistence(other.to_string()),
    }
}

fn move_file(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems (tempdir on another mount); fall back
    // to copy + remove
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)?;
    Ok(())
}
