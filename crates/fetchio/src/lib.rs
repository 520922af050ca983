//! Fetchio: the download engine behind the vodvault worker.
//!
//! The engine covers everything between "here is a URL plus captured browser
//! headers" and "here is a finished MP4": HTTP session construction, HLS
//! playlist parsing with variant selection, concurrent segment download with
//! header-strategy fallback and AES-128 decryption, and the external ffmpeg
//! merge. Job-level orchestration (store, queue, retry scheduling) lives in
//! the `vodvault` application crate.

pub mod config;
pub mod error;
pub mod headers;
pub mod hls;
pub mod muxer;
pub mod session;

pub use config::{DEFAULT_USER_AGENT, DownloaderOptions, SessionConfig};
pub use error::{DownloadError, PlaylistErrorKind};
pub use headers::HeaderBag;
pub use hls::downloader::{FailedSegment, FailureKind, ProgressSink, SegmentDownloader};
pub use hls::playlist::{PlaylistDescriptor, PlaylistParser, Segment, SegmentKey};
pub use muxer::Muxer;
pub use session::Session;
