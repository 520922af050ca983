//! HLS playlist fetching and interpretation.
//!
//! Turns a playlist URL into an ordered segment list with per-segment
//! encryption metadata. Master playlists are resolved to their highest
//! bandwidth variant; the variant fetch reuses the same session so cookies
//! and TLS state issued on the master fetch carry over.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use m3u8_rs::{MasterPlaylist, MediaPlaylist, VariantStream, parse_playlist_res};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{DownloadError, PlaylistErrorKind};
use crate::headers::{HeaderBag, sanitize_accept_encoding};
use crate::session::Session;

/// Hard cap on playlist body size.
const MAX_PLAYLIST_BYTES: usize = 10 * 1024 * 1024;
/// Content-Length above this with a media-like Content-Type is rejected
/// before the body is read.
const SUSPICIOUS_CONTENT_LENGTH: u64 = 1024 * 1024;
/// Master playlists nesting deeper than this are treated as hostile.
const MAX_VARIANT_DEPTH: u8 = 3;

/// AES-128 key reference attached to a segment. A missing IV means the
/// segment's sequence number (big-endian, zero-padded to 16 bytes) is the IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    /// Absolute key URI.
    pub uri: String,
    pub iv: Option<[u8; 16]>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub url: Url,
    pub duration: f32,
    /// Position in discovery order, 0-based.
    pub index: usize,
    /// HLS media sequence number: `media_sequence + index`.
    pub sequence: u64,
    pub key: Option<SegmentKey>,
}

#[derive(Debug, Clone)]
pub struct PlaylistDescriptor {
    pub segments: Vec<Segment>,
    /// Total duration in whole seconds.
    pub duration: u64,
    pub resolution: Option<String>,
    pub has_encryption: bool,
    pub base_url: String,
    /// Set when a master playlist was resolved to a variant.
    pub selected_variant_url: Option<String>,
}

impl PlaylistDescriptor {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

pub struct PlaylistParser {
    session: Session,
    headers: HeaderBag,
    timeout: Duration,
}

impl PlaylistParser {
    pub fn new(session: Session, mut headers: HeaderBag) -> Self {
        sanitize_accept_encoding(&mut headers);
        Self {
            session,
            headers,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn parse(&self, url: &str) -> Result<PlaylistDescriptor, DownloadError> {
        let playlist_url = Url::parse(url).map_err(|e| {
            DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                format!("invalid playlist URL {url}: {e}"),
            )
        })?;
        self.parse_at_depth(playlist_url, 0).await
    }

    fn parse_at_depth(
        &self,
        playlist_url: Url,
        depth: u8,
    ) -> Pin<Box<dyn Future<Output = Result<PlaylistDescriptor, DownloadError>> + Send + '_>> {
        Box::pin(async move {
            if depth >= MAX_VARIANT_DEPTH {
                return Err(DownloadError::playlist(
                    PlaylistErrorKind::NoSegments,
                    format!("variant nesting exceeds {MAX_VARIANT_DEPTH} levels"),
                ));
            }

            let content = self.fetch_playlist(&playlist_url).await?;

            match parse_playlist_res(content.as_bytes()) {
                Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
                    info!(url = %playlist_url, "Master playlist detected, selecting best quality");
                    self.resolve_master(master, &playlist_url, depth).await
                }
                Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                    debug!(url = %playlist_url, segments = media.segments.len(), "Media playlist detected");
                    extract_media_playlist(&media, &playlist_url)
                }
                Err(e) => Err(DownloadError::playlist(
                    PlaylistErrorKind::BadResponse,
                    format!("failed to parse playlist {playlist_url}: {e}"),
                )),
            }
        })
    }

    async fn resolve_master(
        &self,
        master: MasterPlaylist,
        master_url: &Url,
        depth: u8,
    ) -> Result<PlaylistDescriptor, DownloadError> {
        let variant = select_variant(&master)?;
        let resolution = variant
            .resolution
            .map(|r| format!("{}x{}", r.width, r.height));

        info!(
            bandwidth = variant.bandwidth,
            resolution = resolution.as_deref().unwrap_or("unknown"),
            "Selected variant"
        );

        let variant_url = master_url.join(&variant.uri).map_err(|e| {
            DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                format!("could not resolve variant URI {}: {e}", variant.uri),
            )
        })?;

        // The recursive parse shares this parser's session so cookies and
        // TLS state from the master fetch survive the indirection.
        let mut descriptor = self.parse_at_depth(variant_url.clone(), depth + 1).await?;
        if resolution.is_some() {
            descriptor.resolution = resolution;
        }
        descriptor.selected_variant_url = Some(variant_url.to_string());
        Ok(descriptor)
    }

    /// Fetch a playlist body with early validation.
    async fn fetch_playlist(&self, url: &Url) -> Result<String, DownloadError> {
        info!(url = %url, "Fetching playlist");

        let response = self
            .session
            .client()
            .get(url.clone())
            .headers(self.headers.to_header_map())
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                format!("failed to fetch playlist {url}: HTTP {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let content_length = response.content_length();

        precheck_response(&content_type, content_length)?;

        let raw = response.bytes().await?;
        // Anything smaller than one TS packet is a truncated transfer or a
        // stub error page, never a usable playlist.
        if raw.len() < crate::hls::ts::TS_PACKET_SIZE {
            return Err(DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                format!("response body of {} bytes is too small", raw.len()),
            ));
        }
        if raw.len() > MAX_PLAYLIST_BYTES {
            return Err(DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                format!(
                    "response of {} bytes exceeds the {} MiB playlist limit",
                    raw.len(),
                    MAX_PLAYLIST_BYTES / 1024 / 1024
                ),
            ));
        }

        inspect_leading_bytes(&raw[..raw.len().min(8192)])?;

        let content = std::str::from_utf8(&raw).map_err(|_| {
            DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                "response is binary data, not an m3u8 playlist",
            )
        })?;

        if !content.trim_start().starts_with("#EXTM3U") {
            let preview: String = content.chars().take(200).collect();
            warn!(url = %url, preview = %preview, "Playlist body does not start with #EXTM3U");
        }

        Ok(content.to_owned())
    }
}

/// Reject responses whose headers already give the game away.
fn precheck_response(
    content_type: &str,
    content_length: Option<u64>,
) -> Result<(), DownloadError> {
    let media_like = ["video/", "audio/", "octet-stream", "image/"]
        .iter()
        .any(|t| content_type.contains(t));

    if !content_type.is_empty()
        && !["mpegurl", "text", "application/vnd.apple"]
            .iter()
            .any(|t| content_type.contains(t))
    {
        warn!(content_type = %content_type, "Content-Type does not look like an m3u8 playlist");
    }

    if media_like && let Some(len) = content_length
        && len > SUSPICIOUS_CONTENT_LENGTH
    {
        return Err(DownloadError::playlist(
            PlaylistErrorKind::BadResponse,
            format!(
                "Content-Length of {:.1} MiB with Content-Type {content_type} \
                 is a media file, not a playlist",
                len as f64 / 1024.0 / 1024.0
            ),
        ));
    }

    Ok(())
}

/// Reject bodies that are recognizably another container format.
fn inspect_leading_bytes(head: &[u8]) -> Result<(), DownloadError> {
    let not_a_playlist = |what: &str| {
        DownloadError::playlist(
            PlaylistErrorKind::NotAPlaylist,
            format!("response is {what}, not an m3u8 playlist"),
        )
    };

    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return Err(not_a_playlist("an MP4 file"));
    }
    if matches!(
        head[..head.len().min(4)],
        [0x00, 0x00, 0x00, 0x1c] | [0x00, 0x00, 0x00, 0x18] | [0x00, 0x00, 0x00, 0x20]
    ) {
        return Err(not_a_playlist("an MP4 file"));
    }
    if head.starts_with(b"\xff\xd8\xff") {
        return Err(not_a_playlist("a JPEG image"));
    }
    if head.starts_with(b"\x89PNG") {
        return Err(not_a_playlist("a PNG image"));
    }
    Ok(())
}

/// Pick the highest declared bandwidth variant.
fn select_variant(master: &MasterPlaylist) -> Result<&VariantStream, DownloadError> {
    if master.variants.is_empty() {
        return Err(DownloadError::playlist(
            PlaylistErrorKind::NoVariants,
            "no variants found in master playlist",
        ));
    }

    let mut ordered: Vec<&VariantStream> = master.variants.iter().collect();
    ordered.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    Ok(ordered[0])
}

/// Extract the ordered segment list from a media playlist.
fn extract_media_playlist(
    playlist: &MediaPlaylist,
    playlist_url: &Url,
) -> Result<PlaylistDescriptor, DownloadError> {
    if playlist.segments.is_empty() {
        return Err(DownloadError::playlist(
            PlaylistErrorKind::NoSegments,
            "no segments found in playlist",
        ));
    }

    let media_sequence = playlist.media_sequence;
    let mut segments = Vec::with_capacity(playlist.segments.len());
    let mut total_duration = 0f64;
    // Keys rotate: an EXT-X-KEY applies to its segment and every following
    // one until the next EXT-X-KEY (METHOD=NONE clears it).
    let mut current_key: Option<SegmentKey> = None;

    for (index, media_segment) in playlist.segments.iter().enumerate() {
        if let Some(key) = &media_segment.key {
            current_key = match &key.method {
                m3u8_rs::KeyMethod::AES128 => match &key.uri {
                    Some(uri) => resolve_key(uri, key.iv.as_deref(), playlist_url),
                    None => {
                        warn!(index, "AES-128 key without URI; treating segment as clear");
                        None
                    }
                },
                m3u8_rs::KeyMethod::None => None,
                other => {
                    warn!(index, method = ?other, "Unsupported key method; treating segment as clear");
                    None
                }
            };
        }

        let segment_url = playlist_url.join(&media_segment.uri).map_err(|e| {
            DownloadError::playlist(
                PlaylistErrorKind::BadResponse,
                format!("could not resolve segment URI {}: {e}", media_segment.uri),
            )
        })?;

        segments.push(Segment {
            url: segment_url,
            duration: media_segment.duration,
            index,
            sequence: media_sequence + index as u64,
            key: current_key.clone(),
        });
        total_duration += media_segment.duration as f64;
    }

    let has_encryption = segments.iter().any(|s| s.key.is_some());
    if has_encryption {
        info!("Playlist is encrypted with AES-128");
    }
    info!(
        segments = segments.len(),
        duration_secs = total_duration as u64,
        "Parsed media playlist"
    );

    let base_url = playlist_url
        .join(".")
        .map(|u| u.to_string())
        .unwrap_or_else(|_| playlist_url.to_string());

    Ok(PlaylistDescriptor {
        segments,
        duration: total_duration as u64,
        resolution: None,
        has_encryption,
        base_url,
        selected_variant_url: None,
    })
}

fn resolve_key(uri: &str, iv: Option<&str>, playlist_url: &Url) -> Option<SegmentKey> {
    let key_url = match playlist_url.join(uri) {
        Ok(u) => u.to_string(),
        Err(e) => {
            warn!(uri, error = %e, "Could not resolve key URI; treating segment as clear");
            return None;
        }
    };
    Some(SegmentKey {
        uri: key_url,
        iv: iv.and_then(parse_iv),
    })
}

/// Parse an EXT-X-KEY IV attribute. `0x`/`0X` prefixed and bare hex are both
/// accepted; anything malformed becomes `None` so the sequence-number
/// default applies instead of failing the parse.
fn parse_iv(iv_str: &str) -> Option<[u8; 16]> {
    let hex_str = iv_str
        .strip_prefix("0x")
        .or_else(|| iv_str.strip_prefix("0X"))
        .unwrap_or(iv_str);
    let mut iv = [0u8; 16];
    match hex::decode_to_slice(hex_str, &mut iv) {
        Ok(()) => Some(iv),
        Err(e) => {
            warn!(iv = %iv_str, error = %e, "Malformed IV in playlist; falling back to sequence number");
            None
        }
    }
}
