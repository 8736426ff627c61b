use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::fetcher::Fetcher;
use crate::retry::RetryPolicy;
use crate::types::{Digest, MediaItem, ProcessedEntry, Source};

const STYLE: &str = r#"
body { font-family: Arial, Helvetica, sans-serif; line-height: 1.6; color: #333; max-width: 800px; margin: 0 auto; padding: 16px; }
.header { border-bottom: 2px solid #4a7dbe; padding-bottom: 8px; margin-bottom: 16px; }
.header h1 { margin: 0; color: #4a7dbe; }
.meta { color: #666; font-size: 13px; margin-bottom: 8px; }
.entry h2 { margin-bottom: 4px; }
.entry a { color: #2a5db0; }
.content img { max-width: 100%; height: auto; }
.separator { border-top: 1px solid #ddd; margin: 20px 0; }
.footer { margin-top: 24px; color: #999; font-size: 12px; }
"#;

/// Assembles a digest from processed entries: downloads the media that fits
/// within the size and count caps, rewrites their references to content
/// ids, and renders the HTML and plain text bodies.
pub struct DigestRenderer {
    fetcher: Arc<Fetcher>,
    policy: RetryPolicy,
}

impl DigestRenderer {
    pub fn new(fetcher: Arc<Fetcher>, policy: RetryPolicy) -> Self {
        Self { fetcher, policy }
    }

    /// Returns `None` when there is nothing to send. Media failures never
    /// fail the digest; the affected entry just keeps its text and remote
    /// references.
    pub async fn render(&self, source: &Source, entries: &[ProcessedEntry]) -> Option<Digest> {
        if entries.is_empty() {
            return None;
        }

        let (media, included) = self.materialize_media(source, entries).await;

        let fetched_at = entries[0].entry.fetched_at;
        let html = self.build_html(source, entries, &included, fetched_at);
        let text = build_text(source, entries, fetched_at);
        let subject = format!(
            "RSS update - {} - {} new entries",
            source.name,
            entries.len()
        );

        Some(Digest {
            subject,
            html,
            text,
            media,
        })
    }

    /// Downloads candidates in feed order until the per-digest count cap is
    /// reached. Each download enforces the per-item byte cap; rejected or
    /// failed candidates are skipped.
    async fn materialize_media(
        &self,
        source: &Source,
        entries: &[ProcessedEntry],
    ) -> (Vec<MediaItem>, HashSet<String>) {
        let mut media = Vec::new();
        let mut included = HashSet::new();

        'outer: for processed in entries {
            for candidate in &processed.media {
                if media.len() >= source.max_images_per_mail {
                    debug!(
                        "Media cap of {} reached for {}; skipping remaining candidates",
                        source.max_images_per_mail, source.name
                    );
                    break 'outer;
                }

                let url = candidate.url.as_str();
                let result = self
                    .policy
                    .run("media download", || {
                        self.fetcher.fetch_media(url, source.max_image_bytes)
                    })
                    .await;

                match result {
                    Ok((content_type, data)) => {
                        included.insert(candidate.content_id.clone());
                        media.push(MediaItem {
                            content_id: candidate.content_id.clone(),
                            content_type,
                            data,
                        });
                    }
                    Err(e) => {
                        warn!("Skipping media {} for {}: {}", url, source.name, e);
                    }
                }
            }
        }

        (media, included)
    }

    fn build_html(
        &self,
        source: &Source,
        entries: &[ProcessedEntry],
        included: &HashSet<String>,
        fetched_at: DateTime<Utc>,
    ) -> String {
        let mut html = String::new();
        html.push_str("<html><head><meta charset=\"utf-8\"><style>");
        html.push_str(STYLE);
        html.push_str("</style></head><body>");

        html.push_str(&format!(
            r#"<div class="header"><h1>{}</h1><div class="meta">Feed: {} | Fetched: {} | {} new entries</div></div>"#,
            escape_html(&source.name),
            escape_html(&source.url),
            fetched_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entries.len()
        ));

        for (i, processed) in entries.iter().enumerate() {
            let entry = &processed.entry;
            html.push_str("<div class=\"entry\">");
            html.push_str(&format!(
                r#"<h2><a href="{}" target="_blank">{}</a></h2>"#,
                entry.link,
                escape_html(&entry.title)
            ));

            html.push_str("<div class=\"meta\">");
            if let Some(author) = &entry.author {
                html.push_str(&format!("Author: {} | ", escape_html(author)));
            }
            html.push_str(&format!(
                "Published: {}",
                entry.published.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            html.push_str("</div>");

            let body = rewrite_to_cids(processed, included);
            html.push_str(&format!("<div class=\"content\">{}</div>", body));
            html.push_str("</div>");

            if i < entries.len() - 1 {
                html.push_str("<div class=\"separator\"></div>");
            }
        }

        html.push_str(
            "<div class=\"footer\">Sent automatically by the feed mailer.</div></body></html>",
        );
        html
    }
}

/// Replaces the src of every downloaded media reference with its cid:
/// reference. Candidates that were skipped keep their remote URL.
fn rewrite_to_cids(processed: &ProcessedEntry, included: &HashSet<String>) -> String {
    let mut body = processed.html.clone();
    for candidate in &processed.media {
        if !included.contains(&candidate.content_id) {
            continue;
        }
        let cid_ref = format!(r#"src="cid:{}""#, candidate.content_id);
        body = body.replace(&format!(r#"src="{}""#, candidate.original), &cid_ref);
        body = body.replace(&format!("src='{}'", candidate.original), &cid_ref);
    }
    body
}

fn build_text(source: &Source, entries: &[ProcessedEntry], fetched_at: DateTime<Utc>) -> String {
    let mut text = String::new();
    text.push_str(&format!(
        "{} - {} new entries\nFeed: {}\nFetched: {}\n\n",
        source.name,
        entries.len(),
        source.url,
        fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    text.push_str(&"=".repeat(40));
    text.push_str("\n\n");

    for (i, processed) in entries.iter().enumerate() {
        let entry = &processed.entry;
        text.push_str(&format!("{}\nLink: {}\n", entry.title, entry.link));
        if let Some(author) = &entry.author {
            text.push_str(&format!("Author: {}\n", author));
        }
        text.push_str(&format!(
            "Published: {}\n\n",
            entry.published.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        if !processed.text.is_empty() {
            text.push_str(&processed.text);
            text.push('\n');
        }

        if i < entries.len() - 1 {
            text.push('\n');
            text.push_str(&"-".repeat(40));
            text.push_str("\n\n");
        }
    }

    text
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
