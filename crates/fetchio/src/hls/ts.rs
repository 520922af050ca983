//! MPEG-TS content validation.
//!
//! Anti-hotlink CDNs answer unauthorized segment requests with images or
//! HTML error pages at HTTP 200, so a successful fetch proves nothing. A
//! body is accepted as a TS artifact only when the sync byte shows up where
//! the packet grid says it must.

use std::fmt;

/// Every valid 188-byte MPEG-TS packet starts with this byte.
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_PACKET_SIZE: usize = 188;

/// Number of leading packet slots inspected for sync bytes.
const SYNC_PROBE_PACKETS: usize = 5;
/// Minimum sync-byte hits among the probed slots.
const SYNC_MIN_MATCHES: usize = 2;

const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff";
const PNG_MAGIC: &[u8] = b"\x89PNG";
const GIF_MAGIC: &[u8] = b"GIF8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    TooSmall,
    /// An anti-hotlink placeholder image ("JPEG", "PNG", "GIF").
    Image(&'static str),
    HtmlPage,
    ErrorText,
    NoSyncBytes,
}

impl InvalidReason {
    pub fn is_anti_hotlink_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "content too small"),
            Self::Image(kind) => {
                write!(f, "server returned {kind} image (anti-hotlinking protection)")
            }
            Self::HtmlPage => write!(f, "server returned HTML error page"),
            Self::ErrorText => write!(f, "server returned error response"),
            Self::NoSyncBytes => write!(f, "invalid TS format (no sync bytes found)"),
        }
    }
}

/// Identify anti-hotlink placeholder images by magic bytes.
pub fn image_kind(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(JPEG_MAGIC) {
        Some("JPEG")
    } else if data.starts_with(PNG_MAGIC) {
        Some("PNG")
    } else if data.starts_with(GIF_MAGIC) {
        Some("GIF")
    } else {
        None
    }
}

pub fn starts_with_sync(data: &[u8]) -> bool {
    data.first() == Some(&TS_SYNC_BYTE)
}

fn sync_byte_matches(data: &[u8]) -> usize {
    (0..SYNC_PROBE_PACKETS)
        .map(|i| i * TS_PACKET_SIZE)
        .filter(|&offset| data.get(offset) == Some(&TS_SYNC_BYTE))
        .count()
}

/// Validate a segment body as MPEG-TS.
pub fn validate(data: &[u8]) -> Result<(), InvalidReason> {
    if data.len() < TS_PACKET_SIZE {
        return Err(InvalidReason::TooSmall);
    }

    if let Some(kind) = image_kind(data) {
        return Err(InvalidReason::Image(kind));
    }

    let head = data[..5.min(data.len())].to_ascii_lowercase();
    if head.starts_with(b"<!doc") || head.starts_with(b"<html") || head.starts_with(b"<?xml") {
        return Err(InvalidReason::HtmlPage);
    }

    let preview = data[..500.min(data.len())].to_ascii_lowercase();
    if contains(&preview, b"error") || contains(&preview, b"forbidden") || contains(&preview, b"denied")
    {
        return Err(InvalidReason::ErrorText);
    }

    if sync_byte_matches(data) >= SYNC_MIN_MATCHES {
        Ok(())
    } else {
        Err(InvalidReason::NoSyncBytes)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_body(packets: usize) -> Vec<u8> {
        let mut data = vec![0u8; packets * TS_PACKET_SIZE];
        for i in 0..packets {
            data[i * TS_PACKET_SIZE] = TS_SYNC_BYTE;
        }
        data
    }

    #[test]
    fn accepts_aligned_ts_packets() {
        assert!(validate(&ts_body(5)).is_ok());
        // Two packets are the minimum acceptable evidence.
        assert!(validate(&ts_body(2)).is_ok());
    }

    #[test]
    fn rejects_bodies_below_one_packet() {
        assert_eq!(validate(&[TS_SYNC_BYTE; 187]), Err(InvalidReason::TooSmall));
        assert_eq!(validate(b""), Err(InvalidReason::TooSmall));
    }

    #[test]
    fn a_single_sync_byte_is_not_enough() {
        let mut data = vec![0u8; TS_PACKET_SIZE * 5];
        data[0] = TS_SYNC_BYTE;
        assert_eq!(validate(&data), Err(InvalidReason::NoSyncBytes));
    }

    #[test]
    fn detects_placeholder_images() {
        let mut jpeg = vec![0u8; 400];
        jpeg[..3].copy_from_slice(b"\xff\xd8\xff");
        assert_eq!(validate(&jpeg), Err(InvalidReason::Image("JPEG")));

        let mut png = vec![0u8; 400];
        png[..4].copy_from_slice(b"\x89PNG");
        assert_eq!(validate(&png), Err(InvalidReason::Image("PNG")));

        let mut gif = vec![0u8; 400];
        gif[..4].copy_from_slice(b"GIF8");
        assert_eq!(validate(&gif), Err(InvalidReason::Image("GIF")));
    }

    #[test]
    fn detects_html_error_pages() {
        let mut body = b"<!DOCTYPE html><html><body>nope</body></html>".to_vec();
        body.resize(400, b' ');
        assert_eq!(validate(&body), Err(InvalidReason::HtmlPage));
    }

    #[test]
    fn detects_error_text_in_preview() {
        let mut body = b"{\"message\": \"Access Denied\"}".to_vec();
        body.resize(400, b' ');
        assert_eq!(validate(&body), Err(InvalidReason::ErrorText));
    }

    #[test]
    fn error_text_beyond_preview_window_is_ignored() {
        let mut data = ts_body(5);
        data.extend_from_slice(b"error");
        assert!(validate(&data).is_ok());
    }
}
