use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::types::{MailerError, Result, Source};

/// Top-level configuration file. Unknown source fields fall back to the
/// defaults below; the `email` block is always required.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub email: EmailConfig,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_text_dir")]
    pub text_dir: PathBuf,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub sender_email: String,
    pub sender_password: String,
    pub receiver_email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_max_cache_days")]
    pub max_cache_days: u32,
    #[serde(default = "default_max_image_size_mb")]
    pub max_image_size_mb: f64,
    #[serde(default = "default_max_images_per_mail")]
    pub max_images_per_mail: usize,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub text_dir: Option<PathBuf>,
}

fn default_interval_minutes() -> u64 {
    5
}

fn default_max_cache_days() -> u32 {
    30
}

fn default_max_image_size_mb() -> f64 {
    10.0
}

fn default_max_images_per_mail() -> usize {
    20
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_text_dir() -> PathBuf {
    PathBuf::from("rsspush")
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MailerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| MailerError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Checks every field the scheduler depends on. Runs before anything is
    /// spawned, so a bad file fails the process instead of a cycle.
    pub fn validate(&self) -> Result<()> {
        self.email.validate()?;

        if self.sources.is_empty() {
            return Err(MailerError::Config("no sources configured".to_string()));
        }

        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(MailerError::Config(format!(
                    "source with url {:?} has an empty name",
                    source.url
                )));
            }
            if !names.insert(source.name.as_str()) {
                return Err(MailerError::Config(format!(
                    "duplicate source name {:?}",
                    source.name
                )));
            }
            if source.interval_minutes < 1 {
                return Err(MailerError::Config(format!(
                    "source {:?}: interval_minutes must be at least 1",
                    source.name
                )));
            }
            if source.max_cache_days < 1 {
                return Err(MailerError::Config(format!(
                    "source {:?}: max_cache_days must be at least 1",
                    source.name
                )));
            }
            if source.max_image_size_mb <= 0.0 {
                return Err(MailerError::Config(format!(
                    "source {:?}: max_image_size_mb must be positive",
                    source.name
                )));
            }
            if source.max_images_per_mail < 1 {
                return Err(MailerError::Config(format!(
                    "source {:?}: max_images_per_mail must be at least 1",
                    source.name
                )));
            }
        }

        Ok(())
    }

    /// Validates the file and builds the immutable source set used for the
    /// whole run. Relative source URLs are joined against `base_url` here,
    /// so every `Source` carries an absolute feed URL.
    pub fn sources(&self) -> Result<Vec<Source>> {
        self.validate()?;

        let mut sources = Vec::with_capacity(self.sources.len());
        for sc in &self.sources {
            let url = resolve_url(self.base_url.as_deref(), &sc.url)?;
            sources.push(Source {
                name: sc.name.clone(),
                url,
                interval: Duration::from_secs(sc.interval_minutes * 60),
                max_cache_days: sc.max_cache_days,
                max_image_bytes: (sc.max_image_size_mb * 1024.0 * 1024.0) as u64,
                max_images_per_mail: sc.max_images_per_mail,
                data_dir: sc.data_dir.clone().unwrap_or_else(|| self.data_dir.clone()),
                text_dir: sc.text_dir.clone().unwrap_or_else(|| self.text_dir.clone()),
            });
        }
        Ok(sources)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("seen.db"))
    }
}

impl EmailConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("smtp_server", &self.smtp_server),
            ("sender_email", &self.sender_email),
            ("sender_password", &self.sender_password),
            ("receiver_email", &self.receiver_email),
        ] {
            if value.trim().is_empty() {
                return Err(MailerError::Config(format!("email.{} is required", field)));
            }
        }
        if self.smtp_port == 0 {
            return Err(MailerError::Config("email.smtp_port must be non-zero".to_string()));
        }
        for (field, value) in [
            ("sender_email", &self.sender_email),
            ("receiver_email", &self.receiver_email),
        ] {
            if !value.contains('@') {
                return Err(MailerError::Config(format!(
                    "email.{} does not look like an address: {:?}",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

fn resolve_url(base: Option<&str>, raw: &str) -> Result<String> {
    match Url::parse(raw) {
        Ok(url) => Ok(url.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or_else(|| {
                MailerError::Config(format!("relative source url {:?} needs a base_url", raw))
            })?;
            let joined = Url::parse(base)?.join(raw)?;
            Ok(joined.to_string())
        }
        Err(e) => Err(e.into()),
    }
}
