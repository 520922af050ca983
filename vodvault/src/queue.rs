//! Database-backed FIFO job queue.
//!
//! The queue is a table of job ids ordered by rowid. Pops are a single
//! atomic `DELETE ... RETURNING` of the minimum rowid, so multiple workers
//! can share one queue without double-claiming. Blocking pops wake early on
//! same-process pushes via `Notify` and otherwise poll, which also catches
//! pushes from the API process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::database::DbPool;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct JobQueue {
    pool: DbPool,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a job id to the queue tail.
    pub async fn push(&self, job_id: &str) -> crate::Result<()> {
        sqlx::query("INSERT INTO job_queue (job_id) VALUES (?)")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        debug!(job_id, "Job enqueued");
        self.notify.notify_one();
        Ok(())
    }

    /// Blocking pop from the queue head. Returns `None` when the timeout
    /// elapses with the queue still empty.
    pub async fn pop(&self, timeout: Duration) -> crate::Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job_id) = self.try_pop().await? {
                return Ok(Some(job_id));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn try_pop(&self) -> crate::Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "DELETE FROM job_queue WHERE id = (SELECT MIN(id) FROM job_queue) RETURNING job_id",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(job_id,)| job_id))
    }

    /// Number of queued ids; used for startup logging only.
    pub async fn depth(&self) -> crate::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
