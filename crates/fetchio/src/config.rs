use std::time::Duration;

/// User agent matching the Chrome build whose header order the impersonating
/// session reproduces.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36";

/// Options for building HTTP sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Verify TLS certificates and hostnames. Off by default: the captured
    /// URLs routinely point at CDNs with mis-issued or mismatched certs.
    pub verify_tls: bool,

    /// Per-request timeout applied by callers; also used as the client's
    /// connect timeout.
    pub timeout: Duration,

    /// Whether to follow redirects.
    pub follow_redirects: bool,

    /// User agent string.
    pub user_agent: String,

    /// Maximum idle connections to keep per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verify_tls: false,
            timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            pool_max_idle_per_host: 5,
        }
    }
}

/// Options for the segment downloader.
#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    /// Bounded worker pool size.
    pub max_workers: usize,

    /// Retries per segment (not counting the initial attempt).
    pub max_retries: u32,

    /// Per-request timeout for segment and key fetches.
    pub timeout: Duration,

    /// Persist segment bodies that fail TS validation instead of erroring.
    pub skip_ts_validation: bool,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            skip_ts_validation: false,
        }
    }
}
