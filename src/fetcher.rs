use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::types::{FetchConfig, MailerError, Result};

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Self {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// One GET of the feed document. The caller wraps this in a retry
    /// policy; a non-2xx status surfaces as an HTTP error carrying the
    /// status code.
    pub async fn fetch_feed(&self, url: &str) -> Result<String> {
        debug!("Fetching feed: {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, &self.config.accept)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }

    /// Downloads one media item and enforces the caller's byte cap. The
    /// response must declare an image content type; a declared
    /// Content-Length above the cap rejects the item before the body is
    /// read, and the actual bytes are checked again afterwards.
    pub async fn fetch_media(&self, url: &str, max_bytes: u64) -> Result<(String, Vec<u8>)> {
        debug!("Downloading media: {}", url);

        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.media_timeout_seconds))
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !content_type.starts_with("image/") {
            return Err(MailerError::MediaRejected {
                url: url.to_string(),
                reason: format!("content type {:?} is not an image", content_type),
            });
        }

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(MailerError::MediaRejected {
                    url: url.to_string(),
                    reason: format!("declared length {} exceeds limit {}", length, max_bytes),
                });
            }
        }

        let data = response.bytes().await?;
        if data.len() as u64 > max_bytes {
            return Err(MailerError::MediaRejected {
                url: url.to_string(),
                reason: format!("body of {} bytes exceeds limit {}", data.len(), max_bytes),
            });
        }

        Ok((content_type, data.to_vec()))
    }
}
