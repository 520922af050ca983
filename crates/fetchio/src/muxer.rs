//! External muxer (ffmpeg) driver.
//!
//! Segments are merged with the concat demuxer in stream-copy mode; when
//! that fails the merge is retried as a full H.264/AAC re-encode. Duration
//! probing goes through ffprobe. Both binaries must be on PATH at
//! construction time.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::DownloadError;

const CONCAT_FILE_NAME: &str = "concat_list.txt";
/// Wall-clock limit for the stream-copy merge.
const COPY_TIMEOUT: Duration = Duration::from_secs(600);
/// Wall-clock limit for the re-encode fallback.
const RE_ENCODE_TIMEOUT: Duration = Duration::from_secs(1800);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Muxer {
    ffmpeg: String,
    ffprobe: String,
    version: String,
}

impl Muxer {
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_binaries("ffmpeg", "ffprobe")
    }

    pub fn with_binaries(ffmpeg: &str, ffprobe: &str) -> Result<Self, DownloadError> {
        let version = detect_version(ffmpeg).ok_or_else(|| DownloadError::Configuration {
            reason: format!("{ffmpeg} not found on PATH"),
        })?;
        info!(version = %version, "Muxer ready");
        Ok(Self {
            ffmpeg: ffmpeg.to_owned(),
            ffprobe: ffprobe.to_owned(),
            version,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Merge segment files into `output_file`.
    ///
    /// The concat manifest is written into `concat_dir` and removed again on
    /// every exit path.
    pub async fn merge(
        &self,
        segment_files: &[PathBuf],
        output_file: &Path,
        threads: u32,
        concat_dir: &Path,
        allow_re_encode: bool,
    ) -> Result<(), DownloadError> {
        if segment_files.is_empty() {
            return Err(DownloadError::muxer("no segment files provided"));
        }

        info!(
            segments = segment_files.len(),
            output = %output_file.display(),
            "Merging segments"
        );

        let concat_file = concat_dir.join(CONCAT_FILE_NAME);
        write_concat_manifest(segment_files, &concat_file).await?;

        let result = self
            .merge_with_manifest(&concat_file, output_file, threads, allow_re_encode)
            .await;

        match tokio::fs::remove_file(&concat_file).await {
            Ok(()) => debug!(path = %concat_file.display(), "Cleaned up concat manifest"),
            Err(e) => warn!(path = %concat_file.display(), error = %e, "Failed to remove concat manifest"),
        }

        result
    }

    async fn merge_with_manifest(
        &self,
        concat_file: &Path,
        output_file: &Path,
        threads: u32,
        allow_re_encode: bool,
    ) -> Result<(), DownloadError> {
        let threads = threads.to_string();
        let concat = concat_file.to_string_lossy().into_owned();
        let output = output_file.to_string_lossy().into_owned();

        // Stream copy first: no transcode, just container surgery plus the
        // ADTS-to-ASC bitstream filter AAC-in-TS audio needs inside MP4.
        let copy_args = [
            "-hide_banner",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            &concat,
            "-c",
            "copy",
            "-bsf:a",
            "aac_adtstoasc",
            "-threads",
            &threads,
            "-y",
            &output,
        ];

        if self.run_ffmpeg(&copy_args, COPY_TIMEOUT).await? && output_ok(output_file).await {
            info!(output = %output, "Merge successful (stream copy)");
            return Ok(());
        }

        if !allow_re_encode {
            return Err(DownloadError::muxer("stream-copy merge failed"));
        }

        info!("Copy mode failed, attempting re-encode");
        let encode_args = [
            "-hide_banner",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            &concat,
            "-c:v",
            "libx264",
            "-preset",
            "fast",
            "-crf",
            "23",
            "-c:a",
            "aac",
            "-b:a",
            "128k",
            "-threads",
            &threads,
            "-y",
            &output,
        ];

        if self.run_ffmpeg(&encode_args, RE_ENCODE_TIMEOUT).await? && output_ok(output_file).await
        {
            info!(output = %output, "Merge successful (re-encode)");
            return Ok(());
        }

        Err(DownloadError::muxer(
            "merge failed in both copy and re-encode modes",
        ))
    }

    /// Run ffmpeg with a wall-clock limit. Returns whether the process
    /// exited successfully; spawn failures are hard errors.
    async fn run_ffmpeg(&self, args: &[&str], timeout: Duration) -> Result<bool, DownloadError> {
        debug!(command = %format!("{} {}", self.ffmpeg, args.join(" ")), "Running muxer");

        let mut command = Command::new(&self.ffmpeg);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => {
                error!(timeout_secs = timeout.as_secs(), "Muxer process timed out");
                Ok(false)
            }
            Ok(Err(e)) => Err(DownloadError::muxer(format!("failed to spawn ffmpeg: {e}"))),
            Ok(Ok(output)) => {
                if output.status.success() {
                    Ok(true)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail: String = stderr
                        .lines()
                        .rev()
                        .take(10)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect::<Vec<_>>()
                        .join("\n");
                    error!(code = ?output.status.code(), stderr_tail = %tail, "Muxer failed");
                    Ok(false)
                }
            }
        }
    }

    /// Media duration in whole seconds, or `None` when the probe fails.
    pub async fn probe_duration(&self, file: &Path) -> Option<u64> {
        let result = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&self.ffprobe)
                .args([
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ])
                .arg(file)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!(code = ?output.status.code(), "ffprobe exited non-zero");
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to spawn ffprobe");
                return None;
            }
            Err(_) => {
                warn!("ffprobe timed out");
                return None;
            }
        };

        let raw = String::from_utf8_lossy(&output.stdout);
        let seconds: f64 = raw.trim().parse().ok()?;
        (seconds > 0.0).then_some(seconds as u64)
    }
}

fn detect_version(path: &str) -> Option<String> {
    std::process::Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.to_string()))
        })
}

/// Write the concat demuxer manifest: one `file '<absolute path>'` line per
/// segment, in the order given. Single quotes are escaped as `'\''`.
pub async fn write_concat_manifest(
    segment_files: &[PathBuf],
    manifest_path: &Path,
) -> Result<(), DownloadError> {
    let mut contents = String::new();
    for segment in segment_files {
        let absolute = std::path::absolute(segment)?;
        let escaped = escape_concat_path(&absolute.to_string_lossy());
        contents.push_str(&format!("file '{escaped}'\n"));
    }
    tokio::fs::write(manifest_path, contents).await?;
    Ok(())
}

fn escape_concat_path(path: &str) -> String {
    path.replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_fails_construction() {
        let result = Muxer::with_binaries("definitely-not-an-ffmpeg-binary", "ffprobe");
        assert!(matches!(
            result,
            Err(DownloadError::Configuration { .. })
        ));
    }

    #[test]
    fn version_detection_handles_missing_binary() {
        assert!(detect_version("definitely-not-an-ffmpeg-binary").is_none());
    }

    #[test]
    fn quote_escaping_matches_concat_syntax() {
        assert_eq!(escape_concat_path("/tmp/plain.ts"), "/tmp/plain.ts");
        assert_eq!(
            escape_concat_path("/tmp/it's here.ts"),
            "/tmp/it'\\''s here.ts"
        );
    }

    #[tokio::test]
    async fn manifest_lists_segments_in_given_order() {
        let dir = tempfile::tempdir().unwrap();
        let segments: Vec<PathBuf> = (0..3)
            .map(|i| dir.path().join(format!("segment_{i:05}.ts")))
            .collect();

        let manifest = dir.path().join(CONCAT_FILE_NAME);
        write_concat_manifest(&segments, &manifest).await.unwrap();

        let contents = tokio::fs::read_to_string(&manifest).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            assert!(line.starts_with("file '"));
            assert!(line.contains(&format!("segment_{i:05}.ts")));
        }
    }
}
