//! Concurrent, cancellable segment downloader.
//!
//! Segments are fetched on a bounded pool sharing one HTTP session. Every
//! fetch walks a ladder of Referer/Origin strategies because anti-hotlink
//! CDNs accept or reject requests based on those headers; the first strategy
//! that works is memoized for the rest of the run. Bodies are decrypted when
//! the playlist says so and validated as MPEG-TS before being written to
//! index-keyed files, so the final concat order matches playlist order no
//! matter what order downloads complete in.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::DownloaderOptions;
use crate::error::DownloadError;
use crate::headers::{HeaderBag, sanitize_accept_encoding};
use crate::hls::decryption::{self, DecryptOutcome, KeyCache};
use crate::hls::playlist::Segment;
use crate::hls::ts;
use crate::session::Session;

/// Callback target for per-segment completion. Returning an error aborts the
/// whole run: the stop flag is set, in-flight work is dropped, and the error
/// propagates out of `download_all`.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, completed: usize, total: usize) -> Result<(), DownloadError>;
}

/// No-op sink.
#[async_trait]
impl ProgressSink for () {
    async fn on_progress(&self, _completed: usize, _total: usize) -> Result<(), DownloadError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AntiHotlink,
    Http(u16),
    Network,
    InvalidContent,
    Other,
}

/// Record of a segment that failed after all retries.
#[derive(Debug, Clone)]
pub struct FailedSegment {
    pub index: usize,
    pub url: String,
    pub kind: FailureKind,
    pub error: String,
}

impl FailedSegment {
    pub fn is_anti_hotlink(&self) -> bool {
        matches!(self.kind, FailureKind::AntiHotlink)
            || self.error.to_ascii_lowercase().contains("anti-hotlinking")
    }

    /// Authorization-shaped failure: HTTP 403 or the CDN-custom 474.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.kind, FailureKind::Http(403) | FailureKind::Http(474))
            || self.error.contains("403")
            || self.error.contains("474")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderDirective {
    /// Leave whatever the captured headers carry.
    Keep,
    Set(String),
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderStrategy {
    name: &'static str,
    referer: HeaderDirective,
    origin: HeaderDirective,
}

pub fn segment_file_name(index: usize) -> String {
    format!("segment_{index:05}.ts")
}

/// Doubling backoff in whole seconds, capped so a misconfigured retry count
/// cannot stall a worker for hours.
fn backoff_delay(attempt: u32) -> Duration {
    const MAX_BACKOFF_SECS: u64 = 64;
    Duration::from_secs((1u64 << attempt.min(63)).min(MAX_BACKOFF_SECS))
}

pub struct SegmentDownloader {
    segments: Vec<Segment>,
    out_dir: PathBuf,
    base_headers: HeaderBag,
    session: Session,
    opts: DownloaderOptions,
    m3u8_url: Option<Url>,
    global_key: Option<([u8; 16], Option<[u8; 16]>)>,
    key_cache: KeyCache,
    token: CancellationToken,
    working_strategy: Mutex<Option<HeaderStrategy>>,
    failed: Mutex<Vec<FailedSegment>>,
    completed: AtomicUsize,
}

impl SegmentDownloader {
    pub fn new(
        segments: Vec<Segment>,
        out_dir: impl Into<PathBuf>,
        mut base_headers: HeaderBag,
        session: Session,
        opts: DownloaderOptions,
        m3u8_url: Option<Url>,
    ) -> Self {
        sanitize_accept_encoding(&mut base_headers);
        let token = CancellationToken::new();
        let key_cache = KeyCache::new(
            session.clone(),
            base_headers.to_header_map(),
            opts.timeout,
            token.clone(),
        );
        Self {
            segments,
            out_dir: out_dir.into(),
            base_headers,
            session,
            opts,
            m3u8_url,
            global_key: None,
            key_cache,
            token,
            working_strategy: Mutex::new(None),
            failed: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Use a fixed key (and optional IV) for every segment instead of
    /// per-segment key URIs.
    pub fn with_global_key(mut self, key: [u8; 16], iv: Option<[u8; 16]>) -> Self {
        self.global_key = Some((key, iv));
        self
    }

    /// Signal cooperative cancellation to all in-flight and future work.
    pub fn request_stop(&self) {
        info!("Stop requested for segment downloader");
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn downloaded_count(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed_segments(&self) -> Vec<FailedSegment> {
        self.failed.lock().clone()
    }

    /// Download all segments. Returns the paths of successful segments in
    /// ascending index order; segments missing from the result failed or
    /// were abandoned after a stop request.
    pub async fn download_all(
        &self,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        tokio::fs::create_dir_all(&self.out_dir).await?;

        let total = self.segments.len();
        info!(
            total,
            workers = self.opts.max_workers,
            "Starting segment download"
        );

        let mut slots: Vec<Option<PathBuf>> = vec![None; total];
        {
            let mut completions = futures::stream::iter(self.segments.iter())
                .map(|segment| async move {
                    (segment.index, self.download_segment(segment).await)
                })
                .buffer_unordered(self.opts.max_workers.max(1));

            while let Some((index, outcome)) = completions.next().await {
                if self.token.is_cancelled() {
                    info!("Stop detected, aborting remaining segment downloads");
                    break;
                }

                if let Some(path) = outcome {
                    slots[index] = Some(path);
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }

                if let Err(err) = progress
                    .on_progress(self.completed.load(Ordering::Relaxed), total)
                    .await
                {
                    warn!(error = %err, "Download aborted by progress callback; stopping workers");
                    self.token.cancel();
                    return Err(err);
                }
            }
        }

        let files: Vec<PathBuf> = slots.into_iter().flatten().collect();
        info!(
            successful = files.len(),
            total, "Segment download complete"
        );
        let failed = self.failed.lock().len();
        if failed > 0 {
            warn!(failed, "Some segments failed permanently");
        }
        Ok(files)
    }

    /// Download one segment with retry. Failures after the final retry are
    /// recorded and swallowed; a stop request abandons the segment silently.
    async fn download_segment(&self, segment: &Segment) -> Option<PathBuf> {
        let output_path = self.out_dir.join(segment_file_name(segment.index));

        for attempt in 0..=self.opts.max_retries {
            if self.token.is_cancelled() {
                debug!(index = segment.index, "Segment skipped - stop requested");
                return None;
            }

            let err = match self.attempt_segment(segment, &output_path, attempt).await {
                Ok(written) => return written,
                Err(DownloadError::Cancelled) => {
                    debug!(index = segment.index, "Segment abandoned - stop requested");
                    return None;
                }
                Err(err) => err,
            };

            warn!(
                index = segment.index,
                attempt = attempt + 1,
                error = %err,
                "Failed to download segment"
            );

            if attempt >= self.opts.max_retries {
                error!(
                    index = segment.index,
                    retries = self.opts.max_retries,
                    error = %err,
                    "Segment failed after all attempts"
                );
                self.record_failure(segment, &err);
                return None;
            }

            // Back off 1 s, 2 s, 4 s, ... between attempts. The sleep is
            // interruptible so a stop request does not wait out the delay.
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!(index = segment.index, "Segment retry cancelled - stop requested");
                    return None;
                }
                _ = tokio::time::sleep(backoff_delay(attempt)) => {}
            }
        }

        None
    }

    /// One full attempt: strategy ladder, decryption, validation, write.
    /// `Ok(None)` means a stop request interrupted the attempt.
    async fn attempt_segment(
        &self,
        segment: &Segment,
        output_path: &Path,
        attempt: u32,
    ) -> Result<Option<PathBuf>, DownloadError> {
        if self.token.is_cancelled() {
            return Ok(None);
        }

        let mut content: Option<Bytes> = None;

        // A previously working strategy is tried alone first; enumeration
        // only happens when there is none yet or it stopped working.
        let memoized = self.working_strategy.lock().clone();
        if attempt == 0
            && let Some(strategy) = memoized
        {
            match self.try_fetch(segment, &strategy).await {
                Ok(found) => content = found,
                Err(DownloadError::Cancelled) => return Ok(None),
                Err(err) => {
                    debug!(index = segment.index, error = %err, "Memoized strategy failed");
                }
            }
        }

        if content.is_none() {
            for strategy in self.header_strategies(&segment.url) {
                if self.token.is_cancelled() {
                    return Ok(None);
                }

                if segment.index == 0 && attempt == 0 {
                    info!(strategy = strategy.name, "Trying Referer strategy");
                }

                match self.try_fetch(segment, &strategy).await {
                    Ok(Some(bytes)) => {
                        let mut memo = self.working_strategy.lock();
                        if memo.is_none() {
                            info!(strategy = strategy.name, "Found working Referer strategy");
                            *memo = Some(strategy.clone());
                        }
                        content = Some(bytes);
                        break;
                    }
                    Ok(None) => continue,
                    Err(DownloadError::Cancelled) => return Ok(None),
                    Err(err) => {
                        debug!(
                            index = segment.index,
                            strategy = strategy.name,
                            error = %err,
                            "Strategy attempt failed"
                        );
                        continue;
                    }
                }
            }
        }

        // All strategies exhausted: one more request with the original
        // headers, either to surface a diagnostic error body or, if the
        // server relents, to keep the pipeline going.
        let content = match content {
            Some(c) => c,
            None => self.diagnostic_fetch(segment).await?,
        };

        let content = self.maybe_decrypt(segment, content).await?;

        if let Err(reason) = ts::validate(&content) {
            let encrypted = segment.key.is_some() || self.global_key.is_some();
            if encrypted && ts::image_kind(&content).is_none() {
                warn!(
                    index = segment.index,
                    %reason,
                    "Invalid TS content from encrypted stream - saving anyway for the muxer"
                );
            } else if self.opts.skip_ts_validation {
                warn!(index = segment.index, %reason, "Validation skipped");
            } else {
                let preview = String::from_utf8_lossy(&content[..content.len().min(200)])
                    .into_owned();
                error!(index = segment.index, %reason, preview = %preview, "Segment content rejected");
                return Err(if reason.is_anti_hotlink_image() {
                    DownloadError::AntiHotlink {
                        reason: reason.to_string(),
                    }
                } else {
                    DownloadError::invalid_content(reason.to_string())
                });
            }
        }

        tokio::fs::write(output_path, &content).await?;
        debug!(
            index = segment.index,
            bytes = content.len(),
            "Segment downloaded and validated"
        );
        Ok(Some(output_path.to_path_buf()))
    }

    /// Fetch with one header strategy. `Ok(None)` is a strategy-level
    /// failure (HTTP 474, undersized body, anti-hotlink image) that should
    /// advance the ladder; transport and other status errors are returned
    /// and also advance the ladder.
    async fn try_fetch(
        &self,
        segment: &Segment,
        strategy: &HeaderStrategy,
    ) -> Result<Option<Bytes>, DownloadError> {
        let headers = self.apply_strategy(strategy).to_header_map();

        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            response = self
                .session
                .client()
                .get(segment.url.clone())
                .headers(headers)
                .timeout(self.opts.timeout)
                .send() => response?,
        };

        if segment.index == 0 {
            let cookie_count = response.cookies().count();
            if cookie_count > 0 {
                debug!(cookies = cookie_count, "Response set cookies");
            }
        }

        let status = response.status();
        if status.as_u16() == 474 {
            debug!(
                index = segment.index,
                strategy = strategy.name,
                "Got 474 with current headers"
            );
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DownloadError::http_status(status, segment.url.as_str()));
        }

        let bytes = tokio::select! {
            _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            bytes = response.bytes() => bytes?,
        };

        if bytes.len() < ts::TS_PACKET_SIZE {
            return Ok(None);
        }
        if ts::image_kind(&bytes).is_some() {
            return Ok(None);
        }

        Ok(Some(bytes))
    }

    /// Re-issue the request with the unmodified captured headers after every
    /// strategy failed. A non-2xx answer is logged with its headers and the
    /// first 500 body bytes; a 2xx answer feeds the normal pipeline, where
    /// validation will classify hostile bodies.
    async fn diagnostic_fetch(&self, segment: &Segment) -> Result<Bytes, DownloadError> {
        let response = self
            .session
            .client()
            .get(segment.url.clone())
            .headers(self.base_headers.to_header_map())
            .timeout(self.opts.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = format!("{:?}", response.headers());
            let body = response.bytes().await.unwrap_or_default();
            let preview =
                String::from_utf8_lossy(&body[..body.len().min(500)]).into_owned();
            error!(
                index = segment.index,
                %status,
                response_headers = %headers,
                body_preview = %preview,
                "All header strategies failed"
            );
            return Err(DownloadError::http_status(status, segment.url.as_str()));
        }

        let bytes = response.bytes().await?;
        if bytes.len() < ts::TS_PACKET_SIZE {
            return Err(DownloadError::invalid_content(format!(
                "segment too small: {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    async fn maybe_decrypt(
        &self,
        segment: &Segment,
        content: Bytes,
    ) -> Result<Bytes, DownloadError> {
        let (key, declared_iv) = match (&segment.key, &self.global_key) {
            (Some(segment_key), _) => (
                self.key_cache.fetch(&segment_key.uri).await?,
                segment_key.iv,
            ),
            (None, Some((key, iv))) => (*key, *iv),
            (None, None) => return Ok(content),
        };

        let decrypted =
            decryption::decrypt_segment(&content, &key, declared_iv, segment.sequence)?;
        match &decrypted.outcome {
            DecryptOutcome::Decrypted(strategy) => {
                if segment.index < 3 {
                    info!(
                        index = segment.index,
                        strategy = strategy.as_str(),
                        "Decryption successful"
                    );
                }
            }
            DecryptOutcome::AlreadyClear => {
                if segment.index == 0 {
                    info!("Segment 0 already starts with the sync byte, skipping decryption");
                }
            }
            DecryptOutcome::Unverified => {}
        }
        Ok(decrypted.data)
    }

    /// Referer/Origin combinations, tried in order.
    fn header_strategies(&self, segment_url: &Url) -> Vec<HeaderStrategy> {
        let segment_origin = segment_url.origin().ascii_serialization();

        let mut strategies = vec![
            HeaderStrategy {
                name: "source_page",
                referer: HeaderDirective::Keep,
                origin: HeaderDirective::Keep,
            },
            HeaderStrategy {
                name: "segment_domain",
                referer: HeaderDirective::Set(format!("{segment_origin}/")),
                origin: HeaderDirective::Set(segment_origin),
            },
        ];

        if let Some(m3u8_url) = &self.m3u8_url {
            strategies.push(HeaderStrategy {
                name: "m3u8_url",
                referer: HeaderDirective::Set(m3u8_url.to_string()),
                origin: HeaderDirective::Set(m3u8_url.origin().ascii_serialization()),
            });
        }

        strategies.push(HeaderStrategy {
            name: "no_referer",
            referer: HeaderDirective::Remove,
            origin: HeaderDirective::Remove,
        });

        strategies
    }

    fn apply_strategy(&self, strategy: &HeaderStrategy) -> HeaderBag {
        let mut headers = self.base_headers.clone();
        match &strategy.referer {
            HeaderDirective::Keep => {}
            HeaderDirective::Set(value) => headers.set("Referer", value.clone()),
            HeaderDirective::Remove => {
                headers.remove("Referer");
            }
        }
        match &strategy.origin {
            HeaderDirective::Keep => {}
            HeaderDirective::Set(value) => headers.set("Origin", value.clone()),
            HeaderDirective::Remove => {
                headers.remove("Origin");
            }
        }
        headers
    }

    fn record_failure(&self, segment: &Segment, err: &DownloadError) {
        let kind = match err {
            DownloadError::AntiHotlink { .. } => FailureKind::AntiHotlink,
            DownloadError::HttpStatus { status, .. } => FailureKind::Http(status.as_u16()),
            DownloadError::Network { .. } => FailureKind::Network,
            DownloadError::InvalidContent { .. } => FailureKind::InvalidContent,
            _ => FailureKind::Other,
        };
        self.failed.lock().push(FailedSegment {
            index: segment.index,
            url: segment.url.to_string(),
            kind,
            error: err.to_string(),
        });
    }
}
