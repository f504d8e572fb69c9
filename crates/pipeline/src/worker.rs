//! Worker loop
//!
//! Pulls tasks from the broker, bounds concurrent jobs with a semaphore, and
//! recovers jobs abandoned by a crashed worker at startup: any `processing`
//! row older than `stale_after` is reset to `queued`, its partial artifacts
//! are discarded, and it is re-enqueued to run from stage zero.

use crate::harness::ProcessingHarness;
use crate::stages::StageDriver;
use crate::PipelineContext;
use entity_index_broker::{Broker, ProcessTask, TaskSource};
use entity_index_common::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// One worker process: recovery + consume loop
pub struct Worker {
    ctx: Arc<PipelineContext>,
    harness: Arc<ProcessingHarness>,
    source: Arc<dyn TaskSource>,
    broker: Arc<dyn Broker>,
}

impl Worker {
    #[must_use]
    pub fn new(
        ctx: Arc<PipelineContext>,
        harness: Arc<ProcessingHarness>,
        source: Arc<dyn TaskSource>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            ctx,
            harness,
            source,
            broker,
        }
    }

    /// Reset and re-enqueue jobs abandoned mid-flight; their artifacts are
    /// discarded so the re-run starts clean.
    pub async fn recover_stale_jobs(&self) -> Result<usize> {
        let stale = self
            .ctx
            .store
            .reset_stale(self.ctx.config.stale_after)
            .await
            .map_err(|e| entity_index_common::PipelineError::Persistence(e.to_string()))?;

        for job in &stale {
            for dir in [
                self.ctx.layout.frames_dir(&job.video_id),
                self.ctx.layout.reports_dir(&job.video_id),
            ] {
                if dir.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                        warn!("Could not discard {}: {e}", dir.display());
                    }
                }
            }
            if let Err(e) = self
                .broker
                .enqueue(ProcessTask::new(job.video_id.clone()))
                .await
            {
                // Left in `queued`; the next recovery pass re-enqueues it
                warn!("Could not re-enqueue recovered job {}: {e}", job.video_id);
            } else {
                info!("Recovered stale job {}", job.video_id);
            }
        }
        Ok(stale.len())
    }

    /// Consume tasks until the transport shuts down
    pub async fn run(&self) {
        let permits = Arc::new(Semaphore::new(self.ctx.config.worker_concurrency));
        info!(
            "Worker consuming tasks ({} concurrent jobs)",
            self.ctx.config.worker_concurrency
        );

        while let Some(task) = self.source.next_task().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let driver = StageDriver::new(self.ctx.clone(), self.harness.clone());
            tokio::spawn(async move {
                driver.run_job(&task.video_id).await;
                drop(permit);
            });
        }
        info!("Task source closed, worker loop ending");
    }

    /// Recovery followed by the consume loop
    pub async fn start(&self) {
        match self.recover_stale_jobs().await {
            Ok(0) => {}
            Ok(n) => info!("Recovered {n} stale jobs at startup"),
            Err(e) => error!("Stale job recovery failed: {e}"),
        }
        self.run().await;
    }
}
