//! HTTP session factory.
//!
//! Two client flavors are produced: a standard session for playlist fetches
//! and direct downloads, and an "impersonating" session for segment
//! downloads on CDNs that fingerprint clients. Both keep a cookie jar so a
//! playlist fetch and the segment fetches that follow it share state.

use std::sync::OnceLock;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::DownloadError;

/// Install the process-wide rustls CryptoProvider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProfile {
    Standard,
    Impersonated,
}

/// A shared HTTP client plus the profile it was built with.
///
/// Cloning is cheap (`reqwest::Client` is reference-counted), and the same
/// session instance is safe for concurrent requests, cookie writes included.
#[derive(Clone)]
pub struct Session {
    client: Client,
    profile: SessionProfile,
}

impl Session {
    /// Standard session: rustls with certificate verification following
    /// configuration (disabled by default to tolerate mis-issued CDN certs).
    pub fn standard(config: &SessionConfig) -> Result<Self, DownloadError> {
        install_rustls_provider();

        let client = base_builder(config)
            .build()
            .map_err(DownloadError::from)?;

        Ok(Self {
            client,
            profile: SessionProfile::Standard,
        })
    }

    /// Impersonating session: Chrome header set over forced HTTP/1.1.
    ///
    /// HTTP/1.1 is forced because some CDNs emit headers that are invalid
    /// under HTTP/2 (e.g. `Connection: keep-alive`). A ClientHello
    /// indistinguishable from Chrome's is not expressible through rustls, so
    /// the TLS layer is the standard one and the degradation is logged.
    pub fn impersonated(config: &SessionConfig) -> Result<Self, DownloadError> {
        install_rustls_provider();

        warn!(
            "TLS ClientHello impersonation is unavailable on this stack; \
             using Chrome headers over HTTP/1.1 with standard TLS"
        );

        let result = base_builder(config)
            .http1_only()
            .default_headers(chrome_default_headers())
            .build();

        match result {
            Ok(client) => Ok(Self {
                client,
                profile: SessionProfile::Impersonated,
            }),
            Err(error) => {
                warn!(%error, "Failed to build impersonating client; falling back to standard session");
                Self::standard(config)
            }
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn profile(&self) -> SessionProfile {
        self.profile
    }
}

fn base_builder(config: &SessionConfig) -> reqwest::ClientBuilder {
    let mut builder = Client::builder()
        .cookie_store(true)
        .user_agent(&config.user_agent)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .connect_timeout(config.timeout)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.verify_tls {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
}

/// Headers a current Chrome build sends on media subresource requests.
fn chrome_default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Chromium\";v=\"141\", \"Google Chrome\";v=\"141\", \"Not?A_Brand\";v=\"24\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert(
        "sec-ch-ua-platform",
        HeaderValue::from_static("\"Windows\""),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standard_session_builds() {
        let session = Session::standard(&SessionConfig::default()).unwrap();
        assert_eq!(session.profile(), SessionProfile::Standard);
    }

    #[tokio::test]
    async fn impersonated_session_builds() {
        let session = Session::impersonated(&SessionConfig::default()).unwrap();
        assert_eq!(session.profile(), SessionProfile::Impersonated);
    }

    #[tokio::test]
    async fn sessions_share_one_client_across_clones() {
        let session = Session::standard(&SessionConfig::default()).unwrap();
        let clone = session.clone();
        // Both handles drive the same connection pool and cookie jar.
        assert_eq!(session.profile(), clone.profile());
    }

    #[test]
    fn chrome_headers_include_client_hints() {
        let headers = chrome_default_headers();
        assert!(headers.contains_key("sec-ch-ua"));
        assert_eq!(headers.get("sec-ch-ua-mobile").unwrap(), "?0");
    }
}
