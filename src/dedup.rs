use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::types::{Entry, Result, Source};

/// Durable record of which entries have already been dispatched, keyed by
/// (source, entry id). Rows are written only after a digest is confirmed
/// sent, so anything absent here is still eligible for notification.
#[derive(Clone)]
pub struct DedupLedger {
    pool: SqlitePool,
}

impl DedupLedger {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_entries (
                source     TEXT NOT NULL,
                entry_id   TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                PRIMARY KEY (source, entry_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Opened ledger at {}", path.display());
        Ok(Self { pool })
    }

    /// Returns the subsequence of `entries` not yet recorded for `source`,
    /// in the original order.
    pub async fn filter_new(&self, source: &str, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        let rows = sqlx::query("SELECT entry_id FROM seen_entries WHERE source = ?")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;

        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("entry_id")?;
            seen.insert(id);
        }

        Ok(entries.into_iter().filter(|e| !seen.contains(&e.id)).collect())
    }

    /// Records the entries as seen. Re-committing an already-recorded
    /// entry keeps the original row untouched.
    pub async fn commit(&self, source: &str, entries: &[Entry]) -> Result<()> {
        let now = Utc::now();
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO seen_entries (source, entry_id, first_seen)
                VALUES (?, ?, ?)
                ON CONFLICT (source, entry_id) DO NOTHING
                "#,
            )
            .bind(source)
            .bind(&entry.id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        debug!("Committed {} entries for {}", entries.len(), source);
        Ok(())
    }

    /// Drops records strictly older than each source's retention window.
    /// A record sitting exactly on the boundary stays. `first_seen` is
    /// written and compared through the same driver encoding, so string
    /// order matches time order.
    pub async fn evict(&self, sources: &[Source], now: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        for source in sources {
            let cutoff = now - Duration::days(source.max_cache_days as i64);
            let result =
                sqlx::query("DELETE FROM seen_entries WHERE source = ? AND first_seen < ?")
                    .bind(&source.name)
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?;
            removed += result.rows_affected();
        }

        if removed > 0 {
            info!("Evicted {} ledger records", removed);
        }
        Ok(removed)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    async fn insert_with_time(
        &self,
        source: &str,
        entry_id: &str,
        first_seen: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO seen_entries (source, entry_id, first_seen)
            VALUES (?, ?, ?)
            ON CONFLICT (source, entry_id) DO NOTHING
            "#,
        )
        .bind(source)
        .bind(entry_id)
        .bind(first_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    async fn row_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM seen_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_entry(id: &str) -> Entry {
        Entry {
            id: id.to_string(),
            title: format!("title for {}", id),
            link: format!("https://example.com/{}", id),
            author: None,
            published: Utc::now(),
            body: String::new(),
            fetched_at: Utc::now(),
        }
    }

    fn make_source(name: &str, max_cache_days: u32) -> Source {
        Source {
            name: name.to_string(),
            url: "https://example.com/feed.xml".to_string(),
            interval: std::time::Duration::from_secs(300),
            max_cache_days,
            max_image_bytes: 10 * 1024 * 1024,
            max_images_per_mail: 20,
            data_dir: PathBuf::from("data"),
            text_dir: PathBuf::from("rsspush"),
        }
    }

    #[tokio::test]
    async fn committed_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.db");

        let ledger = DedupLedger::open(&path).await.unwrap();
        ledger
            .commit("blog", &[make_entry("e1"), make_entry("e2")])
            .await
            .unwrap();
        let new = ledger
            .filter_new("blog", vec![make_entry("e1"), make_entry("e2")])
            .await
            .unwrap();
        assert!(new.is_empty());
        ledger.close().await;

        let reopened = DedupLedger::open(&path).await.unwrap();
        let new = reopened
            .filter_new(
                "blog",
                vec![make_entry("e1"), make_entry("e2"), make_entry("e3")],
            )
            .await
            .unwrap();
        let ids: Vec<_> = new.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e3"], "only the unseen entry may come back");
    }

    #[tokio::test]
    async fn filter_preserves_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DedupLedger::open(&dir.path().join("seen.db")).await.unwrap();

        ledger.commit("blog", &[make_entry("b")]).await.unwrap();
        let new = ledger
            .filter_new(
                "blog",
                vec![make_entry("c"), make_entry("b"), make_entry("a")],
            )
            .await
            .unwrap();
        let ids: Vec<_> = new.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["c", "a"]);
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DedupLedger::open(&dir.path().join("seen.db")).await.unwrap();

        let entries = [make_entry("e1")];
        ledger.commit("blog", &entries).await.unwrap();
        ledger.commit("blog", &entries).await.unwrap();

        assert_eq!(ledger.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sources_do_not_share_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DedupLedger::open(&dir.path().join("seen.db")).await.unwrap();

        ledger.commit("alpha", &[make_entry("shared-id")]).await.unwrap();
        let new = ledger
            .filter_new("beta", vec![make_entry("shared-id")])
            .await
            .unwrap();
        assert_eq!(new.len(), 1, "records are scoped per source");
    }

    #[tokio::test]
    async fn eviction_keeps_boundary_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DedupLedger::open(&dir.path().join("seen.db")).await.unwrap();

        let now = Utc::now();
        let source = make_source("blog", 30);
        let cutoff = now - Duration::days(30);

        ledger
            .insert_with_time("blog", "too-old", cutoff - Duration::seconds(1))
            .await
            .unwrap();
        ledger.insert_with_time("blog", "boundary", cutoff).await.unwrap();
        ledger
            .insert_with_time("blog", "fresh", now - Duration::days(1))
            .await
            .unwrap();

        let removed = ledger.evict(&[source], now).await.unwrap();
        assert_eq!(removed, 1);

        let new = ledger
            .filter_new(
                "blog",
                vec![
                    make_entry("too-old"),
                    make_entry("boundary"),
                    make_entry("fresh"),
                ],
            )
            .await
            .unwrap();
        let ids: Vec<_> = new.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            ["too-old"],
            "only the record past the boundary is forgotten"
        );
    }

    #[tokio::test]
    async fn eviction_honors_per_source_retention() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DedupLedger::open(&dir.path().join("seen.db")).await.unwrap();

        let now = Utc::now();
        let age = now - Duration::days(10);
        ledger.insert_with_time("short", "e1", age).await.unwrap();
        ledger.insert_with_time("long", "e1", age).await.unwrap();

        let removed = ledger
            .evict(&[make_source("short", 7), make_source("long", 30)], now)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        assert!(ledger
            .filter_new("short", vec![make_entry("e1")])
            .await
            .unwrap()
            .len()
            == 1);
        assert!(ledger
            .filter_new("long", vec![make_entry("e1")])
            .await
            .unwrap()
            .is_empty());
    }
}
