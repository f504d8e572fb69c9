//! Job state store
//!
//! The single source of truth for job state, backed by SQLite through sqlx.
//! Writes are serialized per job through transactions; reads are plain
//! pool queries and may observe any recently committed state.
//!
//! Invariants enforced at this boundary:
//! - status transitions follow `queued -> processing -> {completed, failed}`
//! - `progress` is clamped to [0, 100] and never decreases before a terminal
//!   state; it is exactly 100 on `completed`
//! - deletion is only permitted in terminal states, or for `processing` jobs
//!   whose `updated_at` is older than the stale timeout

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use entity_index_common::{Job, JobStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Store-level errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("illegal status transition {from} -> {to} for job {video_id}")]
    InvalidTransition {
        video_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("job {0} is still processing and not stale; delete refused")]
    DeleteForbidden(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    video_id        TEXT PRIMARY KEY,
    filename        TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'queued',
    progress        REAL NOT NULL DEFAULT 0,
    current_stage   TEXT,
    status_text     TEXT,
    interval_sec    INTEGER NOT NULL DEFAULT 5,
    duration_sec    REAL,
    frames_analyzed INTEGER,
    unique_entities INTEGER,
    entities_json   TEXT,
    original_path   TEXT,
    voice_path      TEXT,
    frames_path     TEXT,
    report_path     TEXT,
    error           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
"#;

/// Durable job store over a SQLite pool
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (and create if missing) the state database and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!("Job store ready at {}", url);
        Ok(Self { pool })
    }

    /// Create a job record in `queued` and return its identifier
    pub async fn submit(
        &self,
        filename: &str,
        interval_sec: u32,
        original_path: Option<&str>,
        voice_path: Option<&str>,
    ) -> Result<String> {
        // 8 hex chars; re-draw on the (unlikely) collision
        loop {
            let video_id = new_video_id();
            let now = Utc::now();
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO jobs \
                 (video_id, filename, status, progress, current_stage, interval_sec, \
                  original_path, voice_path, created_at, updated_at) \
                 VALUES (?, ?, 'queued', 0, 'queued', ?, ?, ?, ?, ?)",
            )
            .bind(&video_id)
            .bind(filename)
            .bind(interval_sec as i64)
            .bind(original_path)
            .bind(voice_path)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                return Ok(video_id);
            }
            warn!("video_id collision on {video_id}, redrawing");
        }
    }

    /// Fetch the full durable record
    pub async fn get(&self, video_id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;
        job_from_row(&row)
    }

    /// Status/progress write from the owning worker.
    ///
    /// Rejects transitions outside the DAG, clamps progress to [0, 100] and
    /// keeps it monotonic. `completed` forces progress to exactly 100.
    pub async fn update_status(
        &self,
        video_id: &str,
        status: JobStatus,
        progress: f64,
        stage: &str,
        status_text: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, progress FROM jobs WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;

        let current_status: String = row.try_get("status")?;
        let current_progress: f64 = row.try_get("progress")?;
        let current = JobStatus::parse(&current_status)
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;

        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                video_id: video_id.to_string(),
                from: current.as_str(),
                to: status.as_str(),
            });
        }

        let progress = if status == JobStatus::Completed {
            100.0
        } else {
            progress.clamp(0.0, 100.0).max(current_progress)
        };

        sqlx::query(
            "UPDATE jobs SET status = ?, progress = ?, current_stage = ?, \
             status_text = ?, updated_at = ? WHERE video_id = ?",
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(stage)
        .bind(status_text)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record where the submission's files landed once the id existed to
    /// name their directory
    pub async fn set_paths(
        &self,
        video_id: &str,
        original_path: &str,
        voice_path: Option<&str>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET original_path = ?, voice_path = ?, updated_at = ? \
             WHERE video_id = ?",
        )
        .bind(original_path)
        .bind(voice_path)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(video_id.to_string()));
        }
        Ok(())
    }

    /// Record media facts discovered during extraction
    pub async fn update_media(
        &self,
        video_id: &str,
        duration_sec: f64,
        frames_analyzed: i64,
        frames_path: &str,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET duration_sec = ?, frames_analyzed = ?, frames_path = ?, \
             updated_at = ? WHERE video_id = ?",
        )
        .bind(duration_sec)
        .bind(frames_analyzed)
        .bind(frames_path)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(video_id.to_string()));
        }
        Ok(())
    }

    /// Terminal success: persist report facts and land on `completed`/100
    pub async fn finish_completed(
        &self,
        video_id: &str,
        unique_entities: i64,
        entities_json: &str,
        report_path: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET unique_entities = ?, entities_json = ?, report_path = ?, \
             updated_at = ? WHERE video_id = ?",
        )
        .bind(unique_entities)
        .bind(entities_json)
        .bind(report_path)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        self.update_status(video_id, JobStatus::Completed, 100.0, "completed", None)
            .await
    }

    /// Terminal failure: preserve the error message verbatim
    pub async fn finish_failed(&self, video_id: &str, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM jobs WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;
        let current_status: String = row.try_get("status")?;
        let current = JobStatus::parse(&current_status)
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;
        if !current.can_transition_to(JobStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                video_id: video_id.to_string(),
                from: current.as_str(),
                to: "failed",
            });
        }

        sqlx::query(
            "UPDATE jobs SET status = 'failed', current_stage = 'failed', error = ?, \
             updated_at = ? WHERE video_id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Page through jobs, optionally filtered by status. Newest first.
    pub async fn list(
        &self,
        status_filter: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Job>, u64)> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = ((page - 1) * page_size) as i64;

        let (rows, total) = match status_filter {
            Some(status) => {
                let rows = sqlx::query(
                    "SELECT * FROM jobs WHERE status = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(page_size as i64)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
            None => {
                let rows =
                    sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ? OFFSET ?")
                        .bind(page_size as i64)
                        .bind(offset)
                        .fetch_all(&self.pool)
                        .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
        };

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total as u64))
    }

    /// All completed jobs, for search-index rebuilds
    pub async fn list_completed(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'completed' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Delete the record, returning it so the caller can remove artifacts.
    /// Refused for live `processing` jobs younger than `stale_after`.
    pub async fn delete(&self, video_id: &str, stale_after: Duration) -> Result<Job> {
        let job = self.get(video_id).await?;
        if job.status == JobStatus::Processing {
            let age = Utc::now() - job.updated_at;
            if age < chrono_duration(stale_after) {
                return Err(StoreError::DeleteForbidden(video_id.to_string()));
            }
        }
        sqlx::query("DELETE FROM jobs WHERE video_id = ?")
            .bind(video_id)
            .execute(&self.pool)
            .await?;
        Ok(job)
    }

    /// Crash recovery: reset abandoned `processing` jobs to `queued` with
    /// cleared stage/progress, returning them for re-enqueue and artifact
    /// cleanup.
    pub async fn reset_stale(&self, stale_after: Duration) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono_duration(stale_after);
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'processing' AND updated_at < ?")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        let stale = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;

        for job in &stale {
            warn!(
                "Resetting stale job {} (last update {})",
                job.video_id, job.updated_at
            );
            sqlx::query(
                "UPDATE jobs SET status = 'queued', progress = 0, current_stage = 'queued', \
                 status_text = NULL, error = NULL, frames_analyzed = NULL, updated_at = ? \
                 WHERE video_id = ?",
            )
            .bind(Utc::now())
            .bind(&job.video_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(stale)
    }
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 1000))
}

fn new_video_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| StoreError::NotFound(format!("bad status {status_str}")))?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(Job {
        video_id: row.try_get("video_id")?,
        filename: row.try_get("filename")?,
        status,
        progress: row.try_get("progress")?,
        current_stage: row.try_get("current_stage")?,
        status_text: row.try_get("status_text")?,
        interval_sec: row.try_get::<i64, _>("interval_sec")? as u32,
        duration_sec: row.try_get("duration_sec")?,
        frames_analyzed: row.try_get("frames_analyzed")?,
        unique_entities: row.try_get("unique_entities")?,
        entities_json: row.try_get("entities_json")?,
        original_path: row.try_get("original_path")?,
        voice_path: row.try_get("voice_path")?,
        frames_path: row.try_get("frames_path")?,
        report_path: row.try_get("report_path")?,
        error: row.try_get("error")?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}/state.db?mode=rwc", dir.path().display())
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();

        let id = store
            .submit("clip.mp4", 5, Some("/data/videos/x/video.mp4"), None)
            .await
            .unwrap();
        assert_eq!(id.len(), 8);

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.filename, "clip.mp4");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.interval_sec, 5);

        assert!(matches!(
            store.get("deadbeef").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_dag_enforced() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();
        let id = store.submit("clip.mp4", 5, None, None).await.unwrap();

        // queued -> completed is illegal
        let err = store
            .update_status(&id, JobStatus::Completed, 100.0, "completed", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .update_status(&id, JobStatus::Processing, 5.0, "extracting_frames", None)
            .await
            .unwrap();
        store
            .update_status(&id, JobStatus::Completed, 100.0, "completed", None)
            .await
            .unwrap();

        // terminal states are frozen
        let err = store
            .update_status(&id, JobStatus::Processing, 0.0, "extracting_frames", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_progress_monotonic_and_clamped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();
        let id = store.submit("clip.mp4", 5, None, None).await.unwrap();

        store
            .update_status(&id, JobStatus::Processing, 40.0, "detecting_entities", None)
            .await
            .unwrap();
        // An out-of-order lower progress write must not regress
        store
            .update_status(&id, JobStatus::Processing, 20.0, "detecting_entities", None)
            .await
            .unwrap();
        assert_eq!(store.get(&id).await.unwrap().progress, 40.0);

        store
            .update_status(&id, JobStatus::Processing, 250.0, "aggregating_report", None)
            .await
            .unwrap();
        assert_eq!(store.get(&id).await.unwrap().progress, 100.0);
    }

    #[tokio::test]
    async fn test_finish_failed_preserves_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();
        let id = store.submit("clip.mp4", 5, None, None).await.unwrap();
        store
            .update_status(&id, JobStatus::Processing, 5.0, "extracting_frames", None)
            .await
            .unwrap();
        store
            .finish_failed(&id, "Frame extraction produced no frames: unreadable container")
            .await
            .unwrap();

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("no frames"));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();
        let id = store.submit("clip.mp4", 5, None, None).await.unwrap();
        store
            .update_status(&id, JobStatus::Processing, 5.0, "extracting_frames", None)
            .await
            .unwrap();

        // Fresh processing job cannot be deleted
        let err = store.delete(&id, Duration::from_secs(900)).await.unwrap_err();
        assert!(matches!(err, StoreError::DeleteForbidden(_)));

        // But a stale-timeout of zero makes it eligible (abandoned worker)
        let job = store.delete(&id, Duration::from_secs(0)).await.unwrap();
        assert_eq!(job.video_id, id);
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_reset_requeues() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();
        let id = store.submit("clip.mp4", 5, None, None).await.unwrap();
        store
            .update_status(&id, JobStatus::Processing, 55.0, "detecting_entities", None)
            .await
            .unwrap();

        // Nothing is stale with a generous timeout
        assert!(store
            .reset_stale(Duration::from_secs(900))
            .await
            .unwrap()
            .is_empty());

        // With a zero timeout the job is reclaimed
        let stale = store.reset_stale(Duration::from_secs(0)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].video_id, id);

        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.current_stage.as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn test_list_pagination_and_filter() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::connect(&store_url(&dir)).await.unwrap();
        for i in 0..5 {
            let id = store
                .submit(&format!("clip{i}.mp4"), 5, None, None)
                .await
                .unwrap();
            if i < 2 {
                store
                    .update_status(&id, JobStatus::Processing, 1.0, "extracting_frames", None)
                    .await
                    .unwrap();
            }
        }

        let (all, total) = store.list(None, 1, 3).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 3);

        let (queued, total_queued) = store.list(Some(JobStatus::Queued), 1, 10).await.unwrap();
        assert_eq!(total_queued, 3);
        assert_eq!(queued.len(), 3);
    }
}
