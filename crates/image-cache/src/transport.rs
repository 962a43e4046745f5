//! Network transport for original images

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Fetches the raw bytes behind a URL
///
/// Dropping the returned future aborts the transfer.
pub trait Transport: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// HTTP client for fetching images
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new transport with the given per-request timeout
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url = %url, "Fetching image");

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Failed to fetch image");
            return Err(CacheError::Transport(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        let data = response.bytes().await?.to_vec();

        debug!(url = %url, size = data.len(), "Fetched image");
        Ok(data)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(
            concat!("image-cache/", env!("CARGO_PKG_VERSION")),
            Duration::from_secs(30),
        )
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.fetch_bytes(url))
    }
}

/// Accept only absolute http(s) URLs
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| CacheError::InvalidRequest(format!("invalid URL {:?}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(CacheError::InvalidRequest(format!(
            "unsupported URL scheme: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/a.png").is_ok());
        assert!(validate_url("http://localhost:8080/img?id=3").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_bad_input() {
        assert!(validate_url("not a url").is_err());

        let err = validate_url("ftp://example.com/a.png").unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let transport = HttpTransport::new("test", Duration::from_secs(2));
        // Port 9 (discard) on localhost is expected to refuse connections
        let result = transport.fetch("http://127.0.0.1:9/image.png").await;
        assert!(matches!(result, Err(CacheError::Transport(_))));
    }
}
