//! Logging initialization: console plus daily-rolling file output with
//! local-timezone timestamps.

use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "vodvault=info,fetchio_engine=info,sqlx=warn";

/// Custom timer that formats timestamps in the server's local timezone,
/// making logs easier to correlate with local time.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Initialize the global subscriber.
///
/// The filter comes from `LOG_LEVEL` (a bare level like `debug` or a full
/// directive string), falling back to `RUST_LOG`, then the built-in default.
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the background file writer.
pub fn init_logging(log_dir: &Path) -> crate::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "vodvault.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = env_filter();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global subscriber: {e}")))?;

    Ok(guard)
}

fn env_filter() -> EnvFilter {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        let directive = if level.contains('=') || level.contains(',') {
            level
        } else {
            // Bare level: apply it to this workspace's crates only.
            let level = level.to_ascii_lowercase();
            format!("vodvault={level},fetchio_engine={level},sqlx=warn")
        };
        if let Ok(filter) = EnvFilter::try_new(&directive) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}
