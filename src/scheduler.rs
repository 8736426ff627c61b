use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::content::ContentProcessor;
use crate::dedup::DedupLedger;
use crate::digest::DigestRenderer;
use crate::fetcher::Fetcher;
use crate::mailer::DigestTransport;
use crate::parser;
use crate::retry::{RetryError, RetryPolicy};
use crate::types::{ProcessedEntry, Result, Source};

/// Hard cap on entries handled in one cycle. When a feed floods, the
/// overflow stays uncommitted and later cycles drain it in batches
/// instead of producing one enormous digest.
pub const MAX_ENTRIES_PER_CYCLE: usize = 20;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Drives the whole pipeline: polls each source on its own task, turns new
/// entries into digests, dispatches them, and records what was sent.
#[derive(Clone)]
pub struct SourceScheduler {
    fetcher: Arc<Fetcher>,
    processor: Arc<ContentProcessor>,
    renderer: Arc<DigestRenderer>,
    ledger: DedupLedger,
    transport: Arc<dyn DigestTransport>,
    policy: RetryPolicy,
}

impl SourceScheduler {
    pub fn new(
        fetcher: Arc<Fetcher>,
        ledger: DedupLedger,
        transport: Arc<dyn DigestTransport>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let processor = Arc::new(ContentProcessor::new()?);
        let renderer = Arc::new(DigestRenderer::new(fetcher.clone(), policy.clone()));

        Ok(Self {
            fetcher,
            processor,
            renderer,
            ledger,
            transport,
            policy,
        })
    }

    /// Runs every source until the process is stopped. Each source gets its
    /// own task, so a slow or failing feed never delays the others.
    pub async fn run(&self, sources: Vec<Source>) {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for source in &sources {
            let scheduler = self.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_source_loop(source).await;
            }));
        }

        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_maintenance_loop(sources).await;
        }));

        for result in future::join_all(handles).await {
            if let Err(e) = result {
                error!("Scheduler task ended unexpectedly: {}", e);
            }
        }
    }

    /// Polls every source exactly once, then performs one maintenance sweep.
    pub async fn run_once(&self, sources: &[Source]) {
        let cycles = sources.iter().map(|source| self.poll_source(source));
        future::join_all(cycles).await;
        self.run_maintenance(sources).await;
    }

    async fn run_source_loop(&self, source: Source) {
        info!(
            "[{}] Polling {} every {}s",
            source.name,
            source.url,
            source.interval.as_secs()
        );
        loop {
            self.poll_source(&source).await;
            tokio::time::sleep(source.interval).await;
        }
    }

    /// One poll cycle with failures contained: an error is logged and the
    /// source simply tries again next interval, starting from ledger state.
    async fn poll_source(&self, source: &Source) {
        if let Err(e) = self.run_cycle(source).await {
            error!("[{}] Cycle failed: {}", source.name, e);
        }
    }

    async fn run_cycle(&self, source: &Source) -> Result<()> {
        debug!("[{}] Fetching {}", source.name, source.url);
        let content = self
            .policy
            .run("feed fetch", || self.fetcher.fetch_feed(&source.url))
            .await
            .map_err(RetryError::into_inner)?;

        let fetched_at = Utc::now();
        let entries = parser::parse_feed(&content, fetched_at)?;
        debug!("[{}] Feed yielded {} entries", source.name, entries.len());

        let mut new_entries = self.ledger.filter_new(&source.name, entries).await?;
        if new_entries.is_empty() {
            debug!("[{}] No new entries", source.name);
            return Ok(());
        }

        if new_entries.len() > MAX_ENTRIES_PER_CYCLE {
            warn!(
                "[{}] {} new entries exceeds the per-cycle cap of {}; deferring the rest",
                source.name,
                new_entries.len(),
                MAX_ENTRIES_PER_CYCLE
            );
            new_entries.truncate(MAX_ENTRIES_PER_CYCLE);
        }
        info!("[{}] {} new entries", source.name, new_entries.len());

        if let Err(e) = archive::store_entries(source, &new_entries).await {
            warn!("[{}] Failed to archive entries: {}", source.name, e);
        }

        let processed: Vec<ProcessedEntry> = new_entries
            .iter()
            .map(|entry| self.processor.process(entry))
            .collect();

        if let Err(e) = archive::write_text_digest(source, &processed, fetched_at).await {
            warn!("[{}] Failed to write text digest: {}", source.name, e);
        }

        let digest = match self.renderer.render(source, &processed).await {
            Some(digest) => digest,
            None => return Ok(()),
        };

        self.policy
            .run("digest dispatch", || self.transport.dispatch(&digest))
            .await
            .map_err(RetryError::into_inner)?;
        info!(
            "[{}] Dispatched digest with {} entries and {} media items",
            source.name,
            new_entries.len(),
            digest.media.len()
        );

        self.ledger.commit(&source.name, &new_entries).await?;
        Ok(())
    }

    async fn run_maintenance_loop(&self, sources: Vec<Source>) {
        loop {
            tokio::time::sleep(MAINTENANCE_INTERVAL).await;
            self.run_maintenance(&sources).await;
        }
    }

    /// Evicts expired ledger rows and removes aged artifact files.
    async fn run_maintenance(&self, sources: &[Source]) {
        let now = Utc::now();
        if let Err(e) = self.ledger.evict(sources, now).await {
            warn!("Ledger eviction failed: {}", e);
        }
        for source in sources {
            if let Err(e) = archive::cleanup_old(source, now).await {
                warn!("[{}] Cleanup failed: {}", source.name, e);
            }
        }
    }
}
