use std::collections::HashSet;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{Entry, MailerError, Result};

/// Parses a raw feed body into normalized entries, in feed order.
///
/// Identifiers repeated within the same document collapse to the first
/// occurrence. Entries without any link element are skipped.
pub fn parse_feed(content: &str, fetched_at: DateTime<Utc>) -> Result<Vec<Entry>> {
    let feed = parser::parse(content.as_bytes())
        .map_err(|e| MailerError::Parse(format!("Failed to parse feed: {}", e)))?;

    let mut seen_ids = HashSet::new();
    let mut entries = Vec::new();

    for raw in feed.entries {
        let Some(entry) = convert_entry(raw, fetched_at) else {
            continue;
        };
        if !seen_ids.insert(entry.id.clone()) {
            debug!("Skipping repeated entry id within fetch: {}", entry.id);
            continue;
        }
        entries.push(entry);
    }

    debug!("Parsed {} entries", entries.len());
    Ok(entries)
}

fn convert_entry(raw: feed_rs::model::Entry, fetched_at: DateTime<Utc>) -> Option<Entry> {
    let title = raw
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| "Untitled".to_string());

    let Some(link) = raw.links.first().map(|l| l.href.clone()) else {
        debug!("Skipping entry without link: {:?}", title);
        return None;
    };

    // Feeds are allowed to omit timestamps; everything downstream expects
    // one, so fall back to the fetch time.
    let published = raw.published.or(raw.updated).unwrap_or(fetched_at);

    let body = raw
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| raw.summary.as_ref().map(|s| s.content.clone()))
        .unwrap_or_default();

    let author = raw.authors.first().map(|a| a.name.clone());

    Some(Entry {
        id: entry_id(&raw.id, &link, &title, published),
        title,
        link,
        author,
        published,
        body,
        fetched_at,
    })
}

/// Stable identifier chain: feed GUID, else the entry link, else a hash of
/// title and published time. The same entry yields the same identifier on
/// every parse.
fn entry_id(guid: &str, link: &str, title: &str, published: DateTime<Utc>) -> String {
    if !guid.trim().is_empty() {
        return guid.to_string();
    }
    if !link.trim().is_empty() {
        return link.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(published.to_rfc3339().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
