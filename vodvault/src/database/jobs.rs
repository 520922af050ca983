//! Job store repository.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, error, info};

use super::DbPool;
use super::models::{JobRow, JobStatus, parse_headers};

/// Optional columns for a status write.
#[derive(Debug, Default)]
pub struct StatusUpdate {
    pub progress: Option<i64>,
    pub error_message: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
}

impl StatusUpdate {
    pub fn progress(progress: i64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Load a job with its captured request context.
    pub async fn fetch_job(&self, job_id: &str) -> crate::Result<Option<JobRow>> {
        let row = sqlx::query(
            r#"
            SELECT j.id, j.url, j.title, j.retry_count,
                   m.referer, m.headers, m.source_page
            FROM jobs j
            LEFT JOIN job_metadata m ON j.id = m.job_id
            WHERE j.id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| JobRow {
            id: row.get("id"),
            url: row.get("url"),
            title: row.get::<Option<String>, _>("title").unwrap_or_default(),
            retry_count: row.get::<i64, _>("retry_count").max(0) as u32,
            referer: row.get("referer"),
            headers: parse_headers(row.get::<Option<String>, _>("headers").as_deref()),
            source_page: row.get("source_page"),
        }))
    }

    /// Whether the job has been cancelled externally.
    ///
    /// Reads through a dedicated connection so the answer is never served
    /// from a transaction snapshot held elsewhere in the pool. Errors are
    /// reported as "not cancelled": a flaky store must not abort a download
    /// that may be minutes from finishing.
    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        let status = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query_scalar::<_, String>("SELECT status FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(conn.as_mut())
                .await
        }
        .await;

        match status {
            Ok(Some(status)) if status == JobStatus::Cancelled.as_str() => {
                info!(job_id, "Job detected as cancelled");
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(job_id, error = %e, "Failed to check job status");
                false
            }
        }
    }

    /// Guarded status write. Every update carries `AND status != 'cancelled'`
    /// so the worker can never transition a job away from cancellation.
    /// The first `downloading` write with progress 0 stamps `started_at`;
    /// a `completed` write stamps `completed_at` and forces progress 100.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        update: StatusUpdate,
    ) -> crate::Result<()> {
        let mut progress = update.progress;
        if status == JobStatus::Completed {
            progress = Some(100);
        }
        let started_at: Option<DateTime<Utc>> =
            (status == JobStatus::Downloading && progress == Some(0)).then(Utc::now);
        let completed_at: Option<DateTime<Utc>> =
            (status == JobStatus::Completed).then(Utc::now);

        let mut sets = vec!["status = ?"];
        if progress.is_some() {
            sets.push("progress = ?");
        }
        if started_at.is_some() {
            sets.push("started_at = ?");
        }
        if completed_at.is_some() {
            sets.push("completed_at = ?");
        }
        if update.error_message.is_some() {
            sets.push("error_message = ?");
        }
        if update.file_path.is_some() {
            sets.push("file_path = ?");
        }
        if update.file_size.is_some() {
            sets.push("file_size = ?");
        }

        let sql = format!(
            "UPDATE jobs SET {} WHERE id = ? AND status != 'cancelled'",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(status.as_str());
        if let Some(progress) = progress {
            query = query.bind(progress);
        }
        if let Some(started_at) = started_at {
            query = query.bind(started_at);
        }
        if let Some(completed_at) = completed_at {
            query = query.bind(completed_at);
        }
        if let Some(error_message) = &update.error_message {
            query = query.bind(error_message);
        }
        if let Some(file_path) = &update.file_path {
            query = query.bind(file_path);
        }
        if let Some(file_size) = update.file_size {
            query = query.bind(file_size);
        }

        let result = query.bind(job_id).execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            debug!(job_id, status = status.as_str(), "Job status updated");
        }
        // Zero rows usually means the job is cancelled; stay quiet.
        Ok(())
    }

    /// Persist playlist-derived metadata.
    pub async fn set_stream_metadata(
        &self,
        job_id: &str,
        resolution: Option<&str>,
        duration: u64,
        segment_count: usize,
    ) -> crate::Result<()> {
        sqlx::query(
            r#"
            UPDATE job_metadata
            SET resolution = ?, duration = ?, segment_count = ?
            WHERE job_id = ?
            "#,
        )
        .bind(resolution)
        .bind(duration as i64)
        .bind(segment_count as i64)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert-or-update the probed duration for a job.
    pub async fn upsert_duration(&self, job_id: &str, duration: u64) -> crate::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_metadata (job_id, duration)
            VALUES (?, ?)
            ON CONFLICT(job_id) DO UPDATE SET duration = excluded.duration
            "#,
        )
        .bind(job_id)
        .bind(duration as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put a job back in `pending` with an incremented retry count. The
    /// caller re-enqueues the id separately.
    pub async fn requeue_for_retry(&self, job_id: &str, retry_count: u32) -> crate::Result<()> {
        sqlx::query("UPDATE jobs SET retry_count = ?, status = 'pending' WHERE id = ?")
            .bind(retry_count as i64)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
