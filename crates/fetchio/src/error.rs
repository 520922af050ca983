use reqwest::StatusCode;

/// Classification of playlist-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistErrorKind {
    /// The server answered, but not with something usable (non-2xx, too
    /// large, binary, not UTF-8).
    BadResponse,
    /// The body is recognizably another format (MP4, JPEG, PNG).
    NotAPlaylist,
    /// A master playlist with no variant entries.
    NoVariants,
    /// A media playlist with no segment entries.
    NoSegments,
}

impl PlaylistErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadResponse => "bad response",
            Self::NotAPlaylist => "not a playlist",
            Self::NoVariants => "no variants",
            Self::NoSegments => "no segments",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("anti-hotlink protection: {reason}")]
    AntiHotlink { reason: String },

    #[error("link expired or blocked: {reason}")]
    LinkExpired { reason: String },

    #[error("invalid content: {reason}")]
    InvalidContent { reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("playlist error ({}): {reason}", kind.as_str())]
    Playlist {
        kind: PlaylistErrorKind,
        reason: String,
    },

    #[error("muxer error: {reason}")]
    Muxer { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn playlist(kind: PlaylistErrorKind, reason: impl Into<String>) -> Self {
        Self::Playlist {
            kind,
            reason: reason.into(),
        }
    }

    pub fn invalid_content(reason: impl Into<String>) -> Self {
        Self::InvalidContent {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn muxer(reason: impl Into<String>) -> Self {
        Self::Muxer {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Whether the whole job may be re-enqueued after this failure.
    ///
    /// `Cancelled` never retries and never rewrites status. `AntiHotlink`
    /// and `LinkExpired` are terminal: the server has made its position
    /// clear and hammering it again with the same captured headers will not
    /// change the answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::AntiHotlink { .. } | Self::LinkExpired { .. } => false,
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::InvalidContent { .. }
            | Self::Decryption { .. }
            | Self::Playlist { .. }
            | Self::Muxer { .. }
            | Self::Io { .. }
            | Self::Configuration { .. } => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(
            !DownloadError::AntiHotlink {
                reason: "blocked".into()
            }
            .is_retryable()
        );
        assert!(
            !DownloadError::LinkExpired {
                reason: "403".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(
            DownloadError::playlist(PlaylistErrorKind::BadResponse, "HTTP 502").is_retryable()
        );
        assert!(DownloadError::muxer("copy and re-encode both failed").is_retryable());
        assert!(DownloadError::invalid_content("no sync bytes").is_retryable());
    }
}
