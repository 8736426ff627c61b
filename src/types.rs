use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub url: String,
    pub interval: Duration,
    pub max_cache_days: u32,
    pub max_image_bytes: u64,
    pub max_images_per_mail: usize,
    pub data_dir: PathBuf,
    pub text_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub title: String,
    pub link: String,
    pub author: Option<String>,
    pub published: DateTime<Utc>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    VideoThumbnail,
}

#[derive(Debug, Clone)]
pub struct MediaCandidate {
    pub kind: MediaKind,
    pub content_id: String,
    pub original: String, // URL text as it appears in the HTML body
    pub url: String,      // decoded absolute URL used for download
    pub link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaItem {
    pub content_id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProcessedEntry {
    pub entry: Entry,
    pub html: String,
    pub text: String,
    pub media: Vec<MediaCandidate>,
}

#[derive(Debug, Clone)]
pub struct Digest {
    pub subject: String,
    pub html: String,
    pub text: String,
    pub media: Vec<MediaItem>,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub accept: String,
    pub timeout_seconds: u64,
    pub media_timeout_seconds: u64,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Feed-Mailer/1.0".to_string(),
            accept: "application/rss+xml, application/atom+xml, application/xml;q=0.9, */*;q=0.8"
                .to_string(),
            timeout_seconds: 30,
            media_timeout_seconds: 10,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Media rejected for {url}: {reason}")]
    MediaRejected { url: String, reason: String },

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Message build error: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("Address error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MailerError {
    /// Transient failures are worth another attempt; everything else is
    /// terminal for the current operation.
    pub fn is_transient(&self) -> bool {
        match self {
            MailerError::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => status.is_server_error() || status.as_u16() == 429,
                    None => false,
                }
            }
            MailerError::Smtp(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MailerError>;
