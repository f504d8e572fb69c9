//! End-to-end pipeline scenarios over synthetic capabilities
//!
//! Every external engine is a scripted stand-in behind its capability
//! interface; no model weights, ffmpeg, or network access is required.

use entity_index_broker::{Broker, InProcessBroker};
use entity_index_common::{
    Detection, FramesIndex, JobStatus, PipelineError, Result, Source,
};
use entity_index_core::{
    CapabilityResult, DataLayout, DetectorSet, ObjectDetector, PipelineConfig,
};
use entity_index_frames::{SampledFrame, SamplingOptions};
use entity_index_pipeline::{
    CreateJob, FrameSource, JobService, PipelineContext, ProcessingHarness, StageDriver, Worker,
};
use entity_index_search::SearchIndex;
use entity_index_store::JobStore;
use image::RgbImage;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Writes `count` tiny JPEGs on a uniform grid, or fails like an unreadable
/// container
struct ScriptedFrames {
    count: usize,
    interval: u32,
    unreadable: bool,
}

impl FrameSource for ScriptedFrames {
    fn probe_duration(&self, _video_path: &Path) -> Result<f64> {
        if self.unreadable {
            return Err(PipelineError::InputInvalid("unreadable container".to_string()));
        }
        Ok((self.count as u32 * self.interval) as f64)
    }

    fn extract(
        &self,
        _video_path: &Path,
        frames_dir: &Path,
        interval_sec: u32,
        _sampling: &SamplingOptions,
    ) -> Result<Vec<SampledFrame>> {
        if self.unreadable {
            return Err(PipelineError::ExtractionFailed(
                "both extraction paths produced zero frames".to_string(),
            ));
        }
        std::fs::create_dir_all(frames_dir)?;
        let mut frames = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let filename = format!("frame_{:06}.jpg", i + 1);
            let path = frames_dir.join(&filename);
            RgbImage::new(32, 32)
                .save(&path)
                .map_err(|e| PipelineError::Other(e.to_string()))?;
            frames.push(SampledFrame {
                index: i,
                timestamp_sec: (i as u32 * interval_sec) as f64,
                filename,
                path,
            });
        }
        Ok(frames)
    }
}

/// Emits a scripted label on chosen frame ordinals; YOLO runs every frame in
/// order, so the invocation counter tracks the frame index
struct ScriptedDetector {
    label: &'static str,
    confidence: f32,
    on_frames: Vec<usize>,
    next_call: usize,
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&mut self, _image: &RgbImage) -> CapabilityResult<Vec<Detection>> {
        let frame = self.next_call;
        self.next_call += 1;
        if self.on_frames.contains(&frame) {
            Ok(vec![Detection::new(self.label, Source::Yolo, self.confidence)])
        } else {
            Ok(Vec::new())
        }
    }
}

struct TestEnv {
    _dir: TempDir,
    ctx: Arc<PipelineContext>,
    config: PipelineConfig,
}

async fn test_env() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let mut config = PipelineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.state_db_url = format!("sqlite://{}/state.db?mode=rwc", dir.path().display());
    config.smart_sampling_enabled = false;
    config.annotate_frames = false;
    config.discovery_enabled = false;
    config.ocr_enabled = false;
    config.verify_enabled = false;

    DataLayout::new(config.data_dir.clone())
        .ensure_root_dirs()
        .unwrap();
    let store = JobStore::connect(&config.state_db_url).await.unwrap();
    let search = Arc::new(SearchIndex::new(None));
    let ctx = PipelineContext::new(config.clone(), store, search);
    TestEnv {
        _dir: dir,
        ctx,
        config,
    }
}

fn harness_with_yolo(
    config: &PipelineConfig,
    frames: ScriptedFrames,
    detector: Option<ScriptedDetector>,
) -> Arc<ProcessingHarness> {
    let mut set = DetectorSet::new();
    match detector {
        Some(d) => set.yolo = Some(Mutex::new(Box::new(d))),
        None => set.skip("yolo", "weights not found"),
    }
    Arc::new(ProcessingHarness::new(
        config,
        Arc::new(frames),
        Arc::new(set),
        None,
    ))
}

async fn submit_job(env: &TestEnv, interval: u32) -> String {
    let id = env
        .ctx
        .store
        .submit("clip.mp4", interval, None, None)
        .await
        .unwrap();
    let video_dir = env.ctx.layout.video_dir(&id);
    std::fs::create_dir_all(&video_dir).unwrap();
    let video_path = video_dir.join("video.mp4");
    std::fs::write(&video_path, b"synthetic video bytes").unwrap();
    env.ctx
        .store
        .set_paths(&id, &video_path.display().to_string(), None)
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn scenario_two_frame_aircraft() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 2,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "airplane",
            confidence: 0.9,
            on_frames: vec![0, 1],
            next_call: 0,
        }),
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    let job = env.ctx.store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.frames_analyzed, Some(2));
    assert_eq!(job.unique_entities, Some(1));

    let raw = std::fs::read_to_string(env.ctx.layout.report_path(&id)).unwrap();
    let report: entity_index_common::Report = serde_json::from_str(&raw).unwrap();
    assert_eq!(report.frames_analyzed, 2);
    let aircraft = &report.entities["aircraft"];
    assert_eq!(aircraft.appearances, 2);
    assert_eq!(aircraft.presence, 1.0);
    assert_eq!(aircraft.time_ranges.len(), 1);
    assert_eq!(aircraft.time_ranges[0].start_sec, 0.0);
    assert_eq!(aircraft.time_ranges[0].end_sec, 5.0);
    assert!((aircraft.confidence_score - 0.655).abs() < 1e-6);
}

#[tokio::test]
async fn scenario_helicopter_two_ranges() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 6,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "helicopter",
            confidence: 0.8,
            on_frames: vec![0, 1, 2, 4, 5],
            next_call: 0,
        }),
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    let raw = std::fs::read_to_string(env.ctx.layout.report_path(&id)).unwrap();
    let report: entity_index_common::Report = serde_json::from_str(&raw).unwrap();
    let heli = &report.entities["helicopter"];
    assert_eq!(heli.appearances, 5);
    assert_eq!(heli.count, 5);
    assert_eq!(heli.presence, 0.8333);
    assert_eq!(heli.time_ranges.len(), 2);
    assert_eq!(
        (heli.time_ranges[0].start_sec, heli.time_ranges[0].end_sec),
        (0.0, 10.0)
    );
    assert_eq!(
        (heli.time_ranges[1].start_sec, heli.time_ranges[1].end_sec),
        (20.0, 25.0)
    );
}

#[tokio::test]
async fn scenario_all_detectors_unavailable() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 3,
            interval: 5,
            unreadable: false,
        },
        None,
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    // Missing capabilities skip their sources; the job still completes
    let job = env.ctx.store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.unique_entities, Some(0));

    let raw = std::fs::read_to_string(env.ctx.layout.report_path(&id)).unwrap();
    let report: entity_index_common::Report = serde_json::from_str(&raw).unwrap();
    assert!(report.entities.is_empty());
    assert_eq!(report.unique_entities, 0);
}

#[tokio::test]
async fn scenario_unreadable_video_fails_clean() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 0,
            interval: 5,
            unreadable: true,
        },
        None,
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    let job = env.ctx.store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.contains("unreadable container"), "unexpected error: {error}");

    // No partial artifacts survive a failed job
    assert!(!env.ctx.layout.frames_dir(&id).exists());
    assert!(!env.ctx.layout.reports_dir(&id).exists());
}

#[tokio::test]
async fn scenario_stale_recovery_reruns_deterministically() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    // First full run, to capture the reference report
    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 6,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "helicopter",
            confidence: 0.8,
            on_frames: vec![0, 1, 2, 4, 5],
            next_call: 0,
        }),
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;
    let reference = std::fs::read(env.ctx.layout.report_path(&id)).unwrap();

    // Second job "crashes" mid-detection: row stuck in processing with
    // partial frames on disk
    let crashed = submit_job(&env, 5).await;
    env.ctx
        .store
        .update_status(&crashed, JobStatus::Processing, 55.0, "detecting_entities", None)
        .await
        .unwrap();
    std::fs::create_dir_all(env.ctx.layout.frames_dir(&crashed)).unwrap();
    std::fs::write(
        env.ctx.layout.frames_dir(&crashed).join("frame_000001.jpg"),
        b"partial",
    )
    .unwrap();

    let mut config = env.config.clone();
    config.stale_after = std::time::Duration::from_secs(0);
    let store2 = JobStore::connect(&env.config.state_db_url).await.unwrap();
    let ctx2 = PipelineContext::new(config.clone(), store2, Arc::new(SearchIndex::new(None)));

    let harness2 = harness_with_yolo(
        &config,
        ScriptedFrames {
            count: 6,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "helicopter",
            confidence: 0.8,
            on_frames: vec![0, 1, 2, 4, 5],
            next_call: 0,
        }),
    );
    let (broker, source) = InProcessBroker::channel(8);
    let worker = Worker::new(
        ctx2.clone(),
        harness2,
        Arc::new(source),
        Arc::new(broker),
    );

    let recovered = worker.recover_stale_jobs().await.unwrap();
    assert!(recovered >= 1);

    // Reset cleared the partial artifacts and requeued the job
    assert!(!ctx2.layout.frames_dir(&crashed).exists());
    let job = ctx2.store.get(&crashed).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0.0);

    // Re-run lands on a byte-identical report to the reference run
    let harness3 = harness_with_yolo(
        &config,
        ScriptedFrames {
            count: 6,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "helicopter",
            confidence: 0.8,
            on_frames: vec![0, 1, 2, 4, 5],
            next_call: 0,
        }),
    );
    StageDriver::new(ctx2.clone(), harness3).run_job(&crashed).await;
    let rerun = std::fs::read(ctx2.layout.report_path(&crashed)).unwrap();

    let normalize = |bytes: &[u8], id: &str| {
        String::from_utf8(bytes.to_vec()).unwrap().replace(id, "JOB")
    };
    assert_eq!(normalize(&reference, &id), normalize(&rerun, &crashed));
}

#[tokio::test]
async fn frames_json_rerun_is_byte_identical() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 6,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "airplane",
            confidence: 0.9,
            on_frames: vec![0, 1, 2, 3, 4, 5],
            next_call: 0,
        }),
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    let frames_raw = std::fs::read_to_string(env.ctx.layout.frames_index_path(&id)).unwrap();
    let frames: FramesIndex = serde_json::from_str(&frames_raw).unwrap();
    let report_raw = std::fs::read(env.ctx.layout.report_path(&id)).unwrap();
    let report: entity_index_common::Report =
        serde_json::from_slice(&report_raw).unwrap();

    // Aggregation over the persisted frames.json reproduces the report
    let options = entity_index_aggregation::AggregationOptions {
        min_consecutive: env.config.min_consecutive,
        open_vocab_min_consecutive: env.config.open_vocab_min_consecutive,
        discovery_min_consecutive: env.config.discovery_min_consecutive,
        confidence_min_score: env.config.confidence_min_score,
        verify_enabled: env.config.verify_enabled,
        discovery_every_n: env.config.discovery_every_n,
        open_vocab_every_n: env.config.open_vocab_every_n,
        verify_every_n: env.config.verify_every_n,
        ocr_every_n: env.config.ocr_every_n,
    };
    let rebuilt = entity_index_aggregation::build_report(
        &report.video_id,
        &report.filename,
        report.duration_sec,
        report.interval_sec,
        &frames.frames,
        report.transcript.clone(),
        &options,
    );
    assert_eq!(
        serde_json::to_vec_pretty(&rebuilt).unwrap(),
        serde_json::to_vec_pretty(&report).unwrap()
    );
}

#[tokio::test]
async fn service_surface_round_trip() {
    let env = test_env().await;
    let (broker, source) = InProcessBroker::channel(8);
    let broker: Arc<dyn Broker> = Arc::new(broker);
    let service = JobService::new(env.ctx.clone(), broker.clone());

    // Submit through the service: staged upload moves into place
    let staged = env.ctx.layout.root().join("staged_upload.mp4");
    std::fs::write(&staged, b"bytes").unwrap();
    let id = service
        .create_job(CreateJob {
            filename: "clip.mp4".to_string(),
            interval_sec: Some(0), // clamped up to 1
            staged_video: staged,
            staged_voice: None,
        })
        .await
        .unwrap();
    assert_eq!(id.len(), 8);

    let status = service.get_status(&id).await.unwrap();
    assert_eq!(status.status, JobStatus::Queued);
    assert_eq!(status.progress, 0.0);

    // Report is not ready before completion
    assert!(matches!(
        service.get_report(&id).await,
        Err(PipelineError::NotReady(_))
    ));

    // The task landed on the broker
    use entity_index_broker::TaskSource;
    let task = source.next_task().await.unwrap();
    assert_eq!(task.video_id, id);

    // Run the job so frame queries have something to read
    let job = env.ctx.store.get(&id).await.unwrap();
    assert_eq!(job.interval_sec, 1);
    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 4,
            interval: 1,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "airplane",
            confidence: 0.9,
            on_frames: vec![2, 3],
            next_call: 0,
        }),
    );
    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    let report = service.get_report(&id).await.unwrap();
    assert!(report.entities.contains_key("aircraft"));

    // Frame paging with and without the entity filter
    let all = service.list_frames(&id, 1, 2, false, None).await.unwrap();
    assert_eq!(all.total, 4);
    assert_eq!(all.frames.len(), 2);

    let filtered = service
        .list_frames(&id, 1, 10, false, Some("aircraft"))
        .await
        .unwrap();
    assert_eq!(filtered.total, 2);
    assert_eq!(filtered.frames[0].frame_index, 2);

    // Nearest frame: t=2.4 is closest to the frame at t=2
    let nearest = service.nearest_frame(&id, 2.4, 10, None).await.unwrap();
    assert_eq!(nearest.frame_index, 2);
    assert_eq!(nearest.page, 1);

    // Entity-filtered nearest at t=0 snaps to the first aircraft frame
    let nearest = service
        .nearest_frame(&id, 0.0, 10, Some("aircraft"))
        .await
        .unwrap();
    assert_eq!(nearest.frame_index, 2);

    // Delete removes the row and every artifact
    service.delete_job(&id).await.unwrap();
    assert!(matches!(
        service.get_job(&id).await,
        Err(PipelineError::NotFound(_))
    ));
    assert!(!env.ctx.layout.frames_dir(&id).exists());
    assert!(!env.ctx.layout.video_dir(&id).exists());
    assert!(!env.ctx.layout.reports_dir(&id).exists());
}

#[tokio::test]
async fn queue_backpressure_rolls_back_submission() {
    let env = test_env().await;
    let (broker, _source) = InProcessBroker::channel(1);
    let service = JobService::new(env.ctx.clone(), Arc::new(broker));

    let staged_a = env.ctx.layout.root().join("a.mp4");
    std::fs::write(&staged_a, b"bytes").unwrap();
    service
        .create_job(CreateJob {
            filename: "a.mp4".to_string(),
            interval_sec: None,
            staged_video: staged_a,
            staged_voice: None,
        })
        .await
        .unwrap();

    // Queue of one is now full; the second submission must not leave a row
    let staged_b = env.ctx.layout.root().join("b.mp4");
    std::fs::write(&staged_b, b"bytes").unwrap();
    let err = service
        .create_job(CreateJob {
            filename: "b.mp4".to_string(),
            interval_sec: None,
            staged_video: staged_b,
            staged_voice: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("queue is full"));

    let (jobs, total) = service.list_jobs(None, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(jobs[0].filename, "a.mp4");
}

#[tokio::test]
async fn cancellation_at_frame_boundary() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    /// Trips its job's cancellation token from inside the first frame
    struct CancellingDetector {
        ctx: Arc<PipelineContext>,
        video_id: String,
    }

    impl ObjectDetector for CancellingDetector {
        fn detect(&mut self, _image: &RgbImage) -> CapabilityResult<Vec<Detection>> {
            self.ctx.cancellations.cancel(&self.video_id);
            Ok(vec![Detection::new("airplane", Source::Yolo, 0.9)])
        }
    }

    let mut set = DetectorSet::new();
    set.yolo = Some(Mutex::new(Box::new(CancellingDetector {
        ctx: env.ctx.clone(),
        video_id: id.clone(),
    })));
    let harness = Arc::new(ProcessingHarness::new(
        &env.config,
        Arc::new(ScriptedFrames {
            count: 6,
            interval: 5,
            unreadable: false,
        }),
        Arc::new(set),
        None,
    ));

    StageDriver::new(env.ctx.clone(), harness).run_job(&id).await;

    let job = env.ctx.store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled"));
    assert!(!env.ctx.layout.frames_dir(&id).exists());
}

#[tokio::test]
async fn worker_loop_processes_queued_tasks() {
    let env = test_env().await;
    let id = submit_job(&env, 5).await;

    let (broker, source) = InProcessBroker::channel(8);
    let broker = Arc::new(broker);
    broker
        .enqueue(entity_index_broker::ProcessTask::new(id.clone()))
        .await
        .unwrap();

    let harness = harness_with_yolo(
        &env.config,
        ScriptedFrames {
            count: 2,
            interval: 5,
            unreadable: false,
        },
        Some(ScriptedDetector {
            label: "airplane",
            confidence: 0.9,
            on_frames: vec![0, 1],
            next_call: 0,
        }),
    );
    let worker = Arc::new(Worker::new(
        env.ctx.clone(),
        harness,
        Arc::new(source),
        broker.clone(),
    ));

    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    // Poll until the job lands in a terminal state
    let mut status = JobStatus::Queued;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        status = env.ctx.store.get(&id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, JobStatus::Completed);

    drop(broker);
    // Worker loop ends once the transport is gone
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), runner).await;
}
