//! Lifecycle tests across the queue and the job store, exercising the same
//! sequences the worker performs per job.

use std::time::Duration;

use vodvault::database::jobs::{JobStore, StatusUpdate};
use vodvault::database::models::JobStatus;
use vodvault::database::{init_pool, run_migrations};
use vodvault::queue::JobQueue;

async fn setup() -> (JobStore, JobQueue, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/worker.db", dir.path().display());
    let pool = init_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (JobStore::new(pool.clone()), JobQueue::new(pool), dir)
}

async fn insert_job(store: &JobStore, id: &str) {
    sqlx::query("INSERT INTO jobs (id, url, title) VALUES (?, ?, ?)")
        .bind(id)
        .bind("https://example.com/stream/index.m3u8")
        .bind("lifecycle clip")
        .execute(store.pool())
        .await
        .unwrap();
}

async fn status_of(store: &JobStore, id: &str) -> (String, i64, Option<String>) {
    sqlx::query_as("SELECT status, progress, error_message FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn retry_cycle_puts_the_job_back_on_the_queue() {
    let (store, queue, _dir) = setup().await;
    insert_job(&store, "job-retry").await;
    queue.push("job-retry").await.unwrap();

    let popped = queue.pop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(popped.as_deref(), Some("job-retry"));

    // The runner's retry path: reset to pending, bump the count, re-enqueue.
    store.requeue_for_retry("job-retry", 1).await.unwrap();
    queue.push("job-retry").await.unwrap();

    let (status, _, _) = status_of(&store, "job-retry").await;
    assert_eq!(status, "pending");

    let popped_again = queue.pop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(popped_again.as_deref(), Some("job-retry"));
    assert_eq!(queue.pop(Duration::from_millis(50)).await.unwrap(), None);
}

#[tokio::test]
async fn cancellation_wins_every_race_with_the_worker() {
    let (store, _queue, _dir) = setup().await;
    insert_job(&store, "job-cancel").await;

    store
        .update_status("job-cancel", JobStatus::Downloading, StatusUpdate::progress(0))
        .await
        .unwrap();
    store
        .update_status("job-cancel", JobStatus::Downloading, StatusUpdate::progress(47))
        .await
        .unwrap();

    // External client cancels while the worker is mid-download.
    sqlx::query("UPDATE jobs SET status = 'cancelled' WHERE id = 'job-cancel'")
        .execute(store.pool())
        .await
        .unwrap();
    assert!(store.is_cancelled("job-cancel").await);

    // In-flight worker writes land after the cancel; all must bounce.
    store
        .update_status("job-cancel", JobStatus::Downloading, StatusUpdate::progress(53))
        .await
        .unwrap();
    store
        .update_status(
            "job-cancel",
            JobStatus::Completed,
            StatusUpdate {
                file_path: Some("/downloads/completed/lifecycle clip.mp4".into()),
                file_size: Some(1024),
                ..StatusUpdate::default()
            },
        )
        .await
        .unwrap();

    let (status, progress, _) = status_of(&store, "job-cancel").await;
    assert_eq!(status, "cancelled");
    assert_eq!(progress, 47);
}

#[tokio::test]
async fn terminal_failure_persists_the_classifier_message() {
    let (store, _queue, _dir) = setup().await;
    insert_job(&store, "job-fail").await;

    store
        .update_status(
            "job-fail",
            JobStatus::Failed,
            StatusUpdate {
                error_message: Some(
                    "link expired or blocked: 21 segments failed with HTTP 403/474 errors".into(),
                ),
                ..StatusUpdate::default()
            },
        )
        .await
        .unwrap();

    let (status, _, error_message) = status_of(&store, "job-fail").await;
    assert_eq!(status, "failed");
    assert!(error_message.unwrap().contains("403/474"));
}

#[tokio::test]
async fn progress_is_monotone_across_a_normal_run() {
    let (store, _queue, _dir) = setup().await;
    insert_job(&store, "job-ok").await;

    let mut last = -1i64;
    for progress in [0i64, 5, 21, 45, 85, 90, 95] {
        let status = if progress < 90 {
            JobStatus::Downloading
        } else {
            JobStatus::Processing
        };
        store
            .update_status("job-ok", status, StatusUpdate::progress(progress))
            .await
            .unwrap();
        let (_, persisted, _) = status_of(&store, "job-ok").await;
        assert!(persisted >= last);
        last = persisted;
    }

    store
        .update_status("job-ok", JobStatus::Completed, StatusUpdate::default())
        .await
        .unwrap();
    let (status, progress, _) = status_of(&store, "job-ok").await;
    assert_eq!(status, "completed");
    assert_eq!(progress, 100);
}
