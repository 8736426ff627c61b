use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::types::{Entry, ProcessedEntry, Result, Source};

/// Writes one JSON artifact per entry under `{data_dir}/{source}/`.
/// Individual write failures are logged and do not abort the batch.
pub async fn store_entries(source: &Source, entries: &[Entry]) -> Result<()> {
    let dir = source.data_dir.join(&source.name);
    fs::create_dir_all(&dir).await?;

    for entry in entries {
        let path = dir.join(artifact_name(entry));
        match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes).await {
                    warn!(
                        "[{}] Failed to store entry at {}: {}",
                        source.name,
                        path.display(),
                        e
                    );
                }
            }
            Err(e) => {
                warn!("[{}] Failed to serialize entry {}: {}", source.name, entry.id, e);
            }
        }
    }

    debug!("[{}] Stored {} entry artifacts", source.name, entries.len());
    Ok(())
}

/// Writes the batch as one plain text file in the text directory, named
/// `{source}_update_{timestamp}.txt`. Returns the path, or `None` when the
/// batch is empty.
pub async fn write_text_digest(
    source: &Source,
    entries: &[ProcessedEntry],
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if entries.is_empty() {
        return Ok(None);
    }

    fs::create_dir_all(&source.text_dir).await?;
    let path = source.text_dir.join(format!(
        "{}_update_{}.txt",
        source.name,
        now.format("%Y%m%d_%H%M%S")
    ));

    let mut content = String::new();
    content.push_str(&format!("=== RSS update - {} ===\n", source.name));
    content.push_str(&format!("Updated: {}\n", now.format("%Y-%m-%d %H:%M:%S")));
    content.push_str(&format!("Feed: {}\n", source.url));
    content.push_str(&format!("New entries: {}\n\n", entries.len()));

    for processed in entries {
        let entry = &processed.entry;
        content.push_str(&format!(
            "Published: {}\n",
            entry.published.format("%Y-%m-%d %H:%M:%S")
        ));
        content.push_str(&format!(
            "Author: {}\n",
            entry.author.as_deref().unwrap_or("")
        ));
        content.push_str(&format!("Title: {}\n", entry.title));
        content.push_str(&format!("Link: {}\n", entry.link));
        content.push_str(&format!("Content:\n{}\n", processed.text));
        content.push('\n');
        content.push_str(&"=".repeat(50));
        content.push_str("\n\n");
    }

    fs::write(&path, content).await?;
    info!(
        "[{}] Saved {} new entries to {}",
        source.name,
        entries.len(),
        path.display()
    );
    Ok(Some(path))
}

/// Removes artifacts and text digests older than the source's retention
/// window, judged by file modification time. Ledger database files are
/// never touched.
pub async fn cleanup_old(source: &Source, now: DateTime<Utc>) -> Result<u64> {
    let cutoff: SystemTime = (now - chrono::Duration::days(i64::from(source.max_cache_days))).into();

    let mut removed = sweep_dir(&source.data_dir.join(&source.name), cutoff, None).await?;

    let text_prefix = format!("{}_update_", source.name);
    removed += sweep_dir(&source.text_dir, cutoff, Some(&text_prefix)).await?;

    if removed > 0 {
        info!(
            "[{}] Removed {} files older than {} days",
            source.name, removed, source.max_cache_days
        );
    }
    Ok(removed)
}

async fn sweep_dir(dir: &Path, cutoff: SystemTime, prefix: Option<&str>) -> Result<u64> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(item) = read_dir.next_entry().await? {
        let name = item.file_name().to_string_lossy().into_owned();
        if let Some(p) = prefix {
            if !name.starts_with(p) {
                continue;
            }
        }
        if is_ledger_file(&name) {
            continue;
        }

        let meta = match item.metadata().await {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping {}: {}", item.path().display(), e);
                continue;
            }
        };
        if meta.is_dir() {
            continue;
        }
        let modified = match meta.modified() {
            Ok(t) => t,
            Err(_) => continue,
        };

        if modified < cutoff {
            match fs::remove_file(item.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", item.path().display(), e),
            }
        }
    }

    Ok(removed)
}

fn is_ledger_file(name: &str) -> bool {
    name.ends_with(".db") || name.contains(".db-")
}

fn artifact_name(entry: &Entry) -> String {
    let digest = hex::encode(Sha256::digest(entry.id.as_bytes()));
    format!("{}_{}.json", entry.published.format("%Y%m%d"), &digest[..10])
}
