//! Worker configuration from the environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Everything the worker reads from the environment, resolved once at
/// startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// SQLite database shared with the API layer.
    pub database_url: String,
    /// Directory finished MP4s land in.
    pub download_dir: PathBuf,
    /// Concurrent segment downloads per job.
    pub max_download_workers: usize,
    /// Threads handed to ffmpeg.
    pub ffmpeg_threads: u32,
    /// Job-level retry budget.
    pub max_retry_attempts: u32,
    /// Persist segment bodies that fail TS validation.
    pub skip_ts_validation: bool,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:vodvault.db?mode=rwc".to_string(),
            download_dir: PathBuf::from("/downloads/completed"),
            max_download_workers: 2,
            ffmpeg_threads: 4,
            max_retry_attempts: 3,
            skip_ts_validation: false,
            request_timeout: Duration::from_secs(30),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            download_dir: PathBuf::from(env_string(
                "DOWNLOAD_DIR",
                &defaults.download_dir.to_string_lossy(),
            )),
            max_download_workers: env_parse("MAX_DOWNLOAD_WORKERS", defaults.max_download_workers)
                .max(1),
            ffmpeg_threads: env_parse("FFMPEG_THREADS", defaults.ffmpeg_threads),
            max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
            skip_ts_validation: env_bool("SKIP_TS_VALIDATION", defaults.skip_ts_validation),
            request_timeout: defaults.request_timeout,
            log_dir: PathBuf::from(env_string(
                "LOG_DIR",
                &defaults.log_dir.to_string_lossy(),
            )),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "Unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_bool(&raw),
        Err(_) => default,
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_download_workers, 2);
        assert_eq!(config.ffmpeg_threads, 4);
        assert_eq!(config.max_retry_attempts, 3);
        assert!(!config.skip_ts_validation);
        assert_eq!(config.download_dir, PathBuf::from("/downloads/completed"));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("garbage"));
    }
}
