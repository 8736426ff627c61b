pub mod archive;
pub mod config;
pub mod content;
pub mod dedup;
pub mod digest;
pub mod fetcher;
pub mod mailer;
pub mod parser;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use config::Config;
pub use content::ContentProcessor;
pub use dedup::DedupLedger;
pub use digest::DigestRenderer;
pub use fetcher::Fetcher;
pub use mailer::{DigestTransport, SmtpMailer};
pub use parser::parse_feed;
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::SourceScheduler;
pub use types::*;
