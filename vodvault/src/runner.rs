//! Per-job orchestration.
//!
//! Drives one job end-to-end: route by URL shape, fetch (direct MP4 stream
//! or playlist + segments + merge), report progress, honor external
//! cancellation at every checkpoint, and classify failures for the retry
//! policy. The job store is the authority on cancellation; it is re-read
//! with a fresh connection at each checkpoint rather than trusted from
//! memory.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use url::Url;

use fetchio_engine::{
    DownloadError, DownloaderOptions, HeaderBag, Muxer, PlaylistParser, ProgressSink,
    SegmentDownloader, Session, SessionConfig,
};

use crate::config::WorkerConfig;
use crate::database::jobs::{JobStore, StatusUpdate};
use crate::database::models::{JobRow, JobStatus};
use crate::naming::derive_output_path;
use crate::queue::JobQueue;

/// Cancellation is re-checked every this many streamed bytes on the direct
/// download path.
const CANCEL_CHECK_INTERVAL: u64 = 5 * 1024 * 1024;
/// Failed segments classified as anti-hotlink before the job dies terminally.
const ANTI_HOTLINK_THRESHOLD: usize = 5;
/// Failed segments mentioning HTTP 403/474 before the job dies terminally.
const AUTH_FAILURE_THRESHOLD: usize = 20;

pub struct JobRunner {
    store: JobStore,
    queue: JobQueue,
    muxer: Arc<Muxer>,
    config: WorkerConfig,
}

impl JobRunner {
    pub fn new(store: JobStore, queue: JobQueue, muxer: Arc<Muxer>, config: WorkerConfig) -> Self {
        Self {
            store,
            queue,
            muxer,
            config,
        }
    }

    /// Run one job to completion or terminal failure. Failures are fully
    /// handled here, including retry scheduling.
    pub async fn process_job(&self, job_id: &str) {
        info!(job_id, "Processing job");

        if self.store.is_cancelled(job_id).await {
            info!(job_id, "Job was cancelled, skipping");
            return;
        }

        let job = match self.store.fetch_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id, "Job not found");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to load job");
                return;
            }
        };

        let result = if is_direct_download(&job.url) {
            info!(job_id, "Detected as direct download (MP4)");
            self.run_direct(&job).await
        } else {
            self.run_hls(&job).await
        };

        match result {
            Ok(()) => {}
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    /// Direct MP4 path: stream the body to the output file, checking
    /// cancellation every few MiB.
    async fn run_direct(&self, job: &JobRow) -> crate::Result<()> {
        self.store
            .update_status(&job.id, JobStatus::Downloading, StatusUpdate::progress(0))
            .await?;
        info!(url = %job.url, "Starting direct download");

        let headers = request_headers(job);
        let session = Session::standard(&self.session_config())?;

        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let output_file = derive_output_path(&self.config.download_dir, &job.title, &job.id);

        let response = session
            .client()
            .get(job.url.as_str())
            .headers(headers.to_header_map())
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(DownloadError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, &job.url).into());
        }

        let total_size = response.content_length().unwrap_or(0);
        info!(
            size_mib = format!("{:.2}", total_size as f64 / 1024.0 / 1024.0),
            output = %output_file.display(),
            "Downloading"
        );

        let mut file = tokio::fs::File::create(&output_file).await?;
        let mut body = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut since_check: u64 = 0;
        let mut last_progress: i64 = -1;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(DownloadError::from)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            since_check += chunk.len() as u64;

            if total_size > 0 {
                let progress = (downloaded as f64 / total_size as f64 * 95.0) as i64;
                if progress != last_progress {
                    self.store
                        .update_status(
                            &job.id,
                            JobStatus::Downloading,
                            StatusUpdate::progress(progress),
                        )
                        .await?;
                    last_progress = progress;
                }
            }

            if since_check >= CANCEL_CHECK_INTERVAL {
                since_check = 0;
                if self.store.is_cancelled(&job.id).await {
                    info!(job_id = %job.id, "Job cancelled during download, aborting");
                    drop(body);
                    drop(file);
                    remove_if_exists(&output_file).await;
                    return Err(DownloadError::Cancelled.into());
                }
            }
        }
        file.flush().await?;
        drop(file);

        if self.store.is_cancelled(&job.id).await {
            info!(job_id = %job.id, "Job cancelled, cleaning up");
            remove_if_exists(&output_file).await;
            return Err(DownloadError::Cancelled.into());
        }

        let file_size = tokio::fs::metadata(&output_file).await?.len();

        if let Some(duration) = self.muxer.probe_duration(&output_file).await {
            self.store.upsert_duration(&job.id, duration).await?;
        }

        self.store
            .update_status(
                &job.id,
                JobStatus::Completed,
                StatusUpdate {
                    file_path: Some(output_file.to_string_lossy().into_owned()),
                    file_size: Some(file_size as i64),
                    ..StatusUpdate::default()
                },
            )
            .await?;

        info!(
            job_id = %job.id,
            output = %output_file.display(),
            size_mib = format!("{:.2}", file_size as f64 / 1024.0 / 1024.0),
            "Job completed successfully"
        );
        Ok(())
    }

    /// HLS path: parse, download segments concurrently, merge with ffmpeg.
    async fn run_hls(&self, job: &JobRow) -> crate::Result<()> {
        self.store
            .update_status(&job.id, JobStatus::Downloading, StatusUpdate::progress(0))
            .await?;
        info!(url = %job.url, "Starting HLS download");

        let headers = browser_headers(request_headers(job));
        if headers.get("Cookie").is_none() {
            debug!("No Cookie in captured headers");
        }

        // One impersonating session shared by parser, key fetches, and all
        // segment workers, so cookies and TLS state persist across them.
        let session = Session::impersonated(&self.session_config())?;
        let parser = PlaylistParser::new(session.clone(), headers.clone())
            .with_timeout(self.config.request_timeout);
        let playlist = parser.parse(&job.url).await?;

        self.store
            .update_status(&job.id, JobStatus::Downloading, StatusUpdate::progress(5))
            .await?;
        self.store
            .set_stream_metadata(
                &job.id,
                playlist.resolution.as_deref(),
                playlist.duration,
                playlist.segment_count(),
            )
            .await?;
        info!(
            segments = playlist.segment_count(),
            duration_secs = playlist.duration,
            "Parsed playlist"
        );
        if playlist.has_encryption {
            info!("Stream is encrypted, will decrypt during download");
        }

        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("m3u8_{}_", job.id))
            .tempdir()?;

        let options = DownloaderOptions {
            max_workers: self.config.max_download_workers,
            timeout: self.config.request_timeout,
            skip_ts_validation: self.config.skip_ts_validation,
            ..DownloaderOptions::default()
        };
        let downloader = Arc::new(SegmentDownloader::new(
            playlist.segments.clone(),
            temp_dir.path(),
            headers,
            session,
            options,
            Url::parse(&job.url).ok(),
        ));

        let sink = JobProgressSink {
            store: self.store.clone(),
            job_id: job.id.clone(),
            downloader: downloader.clone(),
        };
        let segment_files = downloader.download_all(&sink).await?;

        if segment_files.is_empty() {
            return Err(DownloadError::invalid_content("no segments downloaded successfully").into());
        }
        info!(count = segment_files.len(), "Downloaded segments");
        self.store
            .update_status(&job.id, JobStatus::Downloading, StatusUpdate::progress(85))
            .await?;

        if self.store.is_cancelled(&job.id).await {
            info!(job_id = %job.id, "Job cancelled before merge, cleaning up");
            return Err(DownloadError::Cancelled.into());
        }

        info!("Merging segments with ffmpeg");
        self.store
            .update_status(&job.id, JobStatus::Processing, StatusUpdate::progress(90))
            .await?;

        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let output_file = derive_output_path(&self.config.download_dir, &job.title, &job.id);

        self.muxer
            .merge(
                &segment_files,
                &output_file,
                self.config.ffmpeg_threads,
                temp_dir.path(),
                true,
            )
            .await?;

        let file_size = tokio::fs::metadata(&output_file).await?.len();
        self.store
            .update_status(&job.id, JobStatus::Processing, StatusUpdate::progress(95))
            .await?;

        if self.store.is_cancelled(&job.id).await {
            info!(job_id = %job.id, "Job cancelled, cleaning up output file");
            remove_if_exists(&output_file).await;
            return Err(DownloadError::Cancelled.into());
        }

        self.store
            .update_status(
                &job.id,
                JobStatus::Completed,
                StatusUpdate {
                    file_path: Some(output_file.to_string_lossy().into_owned()),
                    file_size: Some(file_size as i64),
                    ..StatusUpdate::default()
                },
            )
            .await?;

        info!(
            job_id = %job.id,
            output = %output_file.display(),
            size_mib = format!("{:.2}", file_size as f64 / 1024.0 / 1024.0),
            "Job completed successfully"
        );

        if let Err(e) = temp_dir.close() {
            warn!(error = %e, "Failed to clean up temp directory");
        }
        Ok(())
    }

    /// Apply the retry policy to a failed job.
    async fn handle_failure(&self, job: &JobRow, err: crate::Error) {
        match classify_failure(&err, job.retry_count, self.config.max_retry_attempts) {
            FailureDisposition::CancelledNoAction => {
                info!(job_id = %job.id, "Job was cancelled by user, no action needed");
            }
            FailureDisposition::TerminalFailure => {
                error!(job_id = %job.id, error = %err, "Job failed, not retrying");
                self.mark_failed(&job.id, &err).await;
            }
            FailureDisposition::Retry(retry_count) => {
                info!(job_id = %job.id, error = %err, attempt = retry_count, "Retrying job");
                if let Err(e) = self.store.requeue_for_retry(&job.id, retry_count).await {
                    error!(job_id = %job.id, error = %e, "Failed to requeue job");
                    return;
                }
                if let Err(e) = self.queue.push(&job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to push retry onto queue");
                }
            }
        }
    }

    async fn mark_failed(&self, job_id: &str, err: &crate::Error) {
        let update = StatusUpdate {
            error_message: Some(err.to_string()),
            ..StatusUpdate::default()
        };
        if let Err(e) = self.store.update_status(job_id, JobStatus::Failed, update).await {
            error!(job_id, error = %e, "Failed to persist failure state");
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.config.request_timeout,
            ..SessionConfig::default()
        }
    }
}

/// Progress callback bridging the downloader and the job store.
struct JobProgressSink {
    store: JobStore,
    job_id: String,
    downloader: Arc<SegmentDownloader>,
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn on_progress(&self, completed: usize, total: usize) -> Result<(), DownloadError> {
        // Cancellation wins over everything else, including progress writes.
        if self.store.is_cancelled(&self.job_id).await {
            info!(job_id = %self.job_id, "Job cancelled during segment download, aborting");
            return Err(DownloadError::Cancelled);
        }

        let progress = segment_progress(completed, total);
        if let Err(e) = self
            .store
            .update_status(
                &self.job_id,
                JobStatus::Downloading,
                StatusUpdate::progress(progress),
            )
            .await
        {
            // A flaky progress write is not worth aborting the download.
            warn!(job_id = %self.job_id, error = %e, "Failed to write progress");
        }

        let failed = self.downloader.failed_segments();
        let hotlink = failed.iter().filter(|f| f.is_anti_hotlink()).count();
        if hotlink >= ANTI_HOTLINK_THRESHOLD {
            error!(
                job_id = %self.job_id,
                blocked = hotlink,
                "Anti-hotlinking protection detected"
            );
            return Err(DownloadError::AntiHotlink {
                reason: format!(
                    "server blocked segment downloads ({hotlink} segments, anti-hotlinking \
                     protection); try refreshing the source page and retrying"
                ),
            });
        }

        let auth_failures = failed.iter().filter(|f| f.is_auth_failure()).count();
        if auth_failures > AUTH_FAILURE_THRESHOLD {
            error!(
                job_id = %self.job_id,
                failures = auth_failures,
                "Too many HTTP 403/474 errors"
            );
            return Err(DownloadError::LinkExpired {
                reason: format!(
                    "{auth_failures} segments failed with HTTP 403/474 errors \
                     (URL expired or blocked)"
                ),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureDisposition {
    /// Cancellation: no status change, no retry.
    CancelledNoAction,
    /// Mark `failed` with the error message, no retry.
    TerminalFailure,
    /// Set back to `pending` with this retry count and re-enqueue.
    Retry(u32),
}

fn classify_failure(
    err: &crate::Error,
    retry_count: u32,
    max_retry_attempts: u32,
) -> FailureDisposition {
    if err.is_cancelled() {
        return FailureDisposition::CancelledNoAction;
    }

    let retryable = err
        .as_download_error()
        .map(DownloadError::is_retryable)
        // Store and IO hiccups are worth another attempt.
        .unwrap_or(true);
    if !retryable {
        return FailureDisposition::TerminalFailure;
    }

    let next = retry_count + 1;
    if next < max_retry_attempts {
        FailureDisposition::Retry(next)
    } else {
        FailureDisposition::TerminalFailure
    }
}

/// Map segment completion into the [5, 85] progress band.
pub fn segment_progress(completed: usize, total: usize) -> i64 {
    if total == 0 {
        return 5;
    }
    5 + (completed as f64 / total as f64 * 80.0) as i64
}

/// Classify a job URL. MP4s are recognized directly, with a query string,
/// and percent-encoded inside `file=` style parameters; everything else
/// goes down the HLS path.
pub fn is_direct_download(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let decoded = urlencoding::decode(&lower)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| lower.clone());

    let mentions_mp4 =
        |s: &str| s.ends_with(".mp4") || s.contains(".mp4?") || s.contains(".mp4&");

    mentions_mp4(&lower)
        || mentions_mp4(&decoded)
        || (lower.contains("file=") && decoded.contains(".mp4"))
}

/// Headers shared by both download paths: scrub capture artifacts, restore
/// the captured Referer, derive Origin from the source page, and make sure
/// a browser User-Agent is present.
fn request_headers(job: &JobRow) -> HeaderBag {
    let mut headers: HeaderBag = job
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    // A captured Range header would truncate the download.
    headers.remove("Range");
    if headers.get("Sec-Fetch-Dest") == Some("video") {
        headers.set("Sec-Fetch-Dest", "empty");
    }

    if let Some(referer) = &job.referer {
        headers.set("Referer", referer.clone());
    }
    if let Some(source_page) = &job.source_page
        && let Ok(url) = Url::parse(source_page)
    {
        headers.set("Origin", url.origin().ascii_serialization());
    }
    headers.set_if_absent("User-Agent", fetchio_engine::DEFAULT_USER_AGENT);
    headers
}

/// Browser-like headers the HLS path injects when the capture lacks them.
fn browser_headers(mut headers: HeaderBag) -> HeaderBag {
    headers.set_if_absent("Accept", "*/*");
    headers.set_if_absent("Accept-Language", "en-US,en;q=0.9");
    headers.set_if_absent("Accept-Encoding", "gzip, deflate, br");
    headers.set_if_absent("Sec-Fetch-Dest", "empty");
    headers.set_if_absent("Sec-Fetch-Mode", "cors");
    headers.set_if_absent("Sec-Fetch-Site", "cross-site");
    headers
}

async fn remove_if_exists(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn mp4_urls_route_to_direct_download() {
        assert!(is_direct_download("https://example.com/v.mp4"));
        assert!(is_direct_download("https://example.com/V.MP4"));
        assert!(is_direct_download("https://example.com/v.mp4?token=abc"));
        assert!(is_direct_download("https://example.com/v.mp4&session=1"));
        assert!(is_direct_download(
            "https://example.com/play?file=%2Fvideos%2Fclip.mp4&autoplay=1"
        ));
        assert!(is_direct_download(
            "https://example.com/play?file=clip.mp4"
        ));
    }

    #[test]
    fn playlist_urls_route_to_hls() {
        assert!(!is_direct_download("https://example.com/index.m3u8"));
        assert!(!is_direct_download("https://example.com/index.m3u8?sig=x"));
        assert!(!is_direct_download("https://example.com/watch?v=123"));
        assert!(!is_direct_download("https://example.com/video.mpd"));
    }

    #[test]
    fn segment_progress_spans_five_to_eighty_five() {
        assert_eq!(segment_progress(0, 10), 5);
        assert_eq!(segment_progress(5, 10), 45);
        assert_eq!(segment_progress(10, 10), 85);
        assert_eq!(segment_progress(0, 0), 5);
    }

    #[test]
    fn segment_progress_is_monotone() {
        let mut last = 0;
        for completed in 0..=100 {
            let progress = segment_progress(completed, 100);
            assert!(progress >= last);
            last = progress;
        }
    }

    fn job_with_headers(headers: &[(&str, &str)]) -> JobRow {
        JobRow {
            id: "job-1".into(),
            url: "https://example.com/index.m3u8".into(),
            title: "clip".into(),
            retry_count: 0,
            referer: Some("https://host.example/watch/123".into()),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            source_page: Some("https://host.example/watch/123".into()),
        }
    }

    #[test]
    fn request_headers_scrub_capture_artifacts() {
        let job = job_with_headers(&[
            ("Range", "bytes=1000-"),
            ("range", "bytes=0-"),
            ("Sec-Fetch-Dest", "video"),
            ("Cookie", "session=abc"),
        ]);
        let headers = request_headers(&job);

        assert!(headers.get("Range").is_none());
        assert_eq!(headers.get("Sec-Fetch-Dest"), Some("empty"));
        assert_eq!(headers.get("Cookie"), Some("session=abc"));
        assert_eq!(headers.get("Referer"), Some("https://host.example/watch/123"));
        assert_eq!(headers.get("Origin"), Some("https://host.example"));
        assert_eq!(headers.get("User-Agent"), Some(fetchio_engine::DEFAULT_USER_AGENT));
    }

    #[test]
    fn captured_user_agent_is_not_replaced() {
        let job = job_with_headers(&[("User-Agent", "CapturedAgent/1.0")]);
        let headers = request_headers(&job);
        assert_eq!(headers.get("User-Agent"), Some("CapturedAgent/1.0"));
    }

    #[test]
    fn cancellation_never_retries_or_rewrites() {
        let err = crate::Error::from(DownloadError::Cancelled);
        assert_eq!(
            classify_failure(&err, 0, 3),
            FailureDisposition::CancelledNoAction
        );
    }

    #[test]
    fn hotlink_and_expiry_are_terminal() {
        let hotlink = crate::Error::from(DownloadError::AntiHotlink {
            reason: "blocked".into(),
        });
        assert_eq!(
            classify_failure(&hotlink, 0, 3),
            FailureDisposition::TerminalFailure
        );

        let expired = crate::Error::from(DownloadError::LinkExpired {
            reason: "403s everywhere".into(),
        });
        assert_eq!(
            classify_failure(&expired, 0, 3),
            FailureDisposition::TerminalFailure
        );
    }

    #[test]
    fn transient_failures_retry_until_the_budget_runs_out() {
        let err = crate::Error::from(DownloadError::invalid_content("garbled"));
        assert_eq!(classify_failure(&err, 0, 3), FailureDisposition::Retry(1));
        assert_eq!(classify_failure(&err, 1, 3), FailureDisposition::Retry(2));
        // retry_count + 1 == max: terminal.
        assert_eq!(
            classify_failure(&err, 2, 3),
            FailureDisposition::TerminalFailure
        );
    }

    #[test]
    fn store_errors_count_as_retryable() {
        let err = crate::Error::Other("sqlite locked".into());
        assert_eq!(classify_failure(&err, 0, 3), FailureDisposition::Retry(1));
    }

    #[test]
    fn browser_headers_fill_gaps_only() {
        let job = job_with_headers(&[("Accept", "application/vnd.apple.mpegurl")]);
        let headers = browser_headers(request_headers(&job));

        // Captured value survives.
        assert_eq!(headers.get("Accept"), Some("application/vnd.apple.mpegurl"));
        // Missing values are injected.
        assert_eq!(headers.get("Accept-Language"), Some("en-US,en;q=0.9"));
        assert_eq!(headers.get("Accept-Encoding"), Some("gzip, deflate, br"));
        assert_eq!(headers.get("Sec-Fetch-Mode"), Some("cors"));
        assert_eq!(headers.get("Sec-Fetch-Site"), Some("cross-site"));
    }
}
