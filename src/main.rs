use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use feed_mailer::config::Config;
use feed_mailer::dedup::DedupLedger;
use feed_mailer::fetcher::Fetcher;
use feed_mailer::mailer::SmtpMailer;
use feed_mailer::retry::RetryPolicy;
use feed_mailer::scheduler::SourceScheduler;
use feed_mailer::types::FetchConfig;

/// Polls RSS and Atom feeds and mails new entries as digests.
#[derive(Parser, Debug)]
#[command(name = "feed-mailer", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Poll every source once, then exit
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting feed-mailer");
    info!("Configuration file: {}", args.config.display());

    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let sources = config.sources().context("invalid configuration")?;
    info!("Watching {} feed sources", sources.len());

    let fetcher = Arc::new(Fetcher::new(FetchConfig::default()));
    let ledger = DedupLedger::open(&config.ledger_path())
        .await
        .context("failed to open the dedup ledger")?;
    let mailer = Arc::new(SmtpMailer::new(&config.email).context("invalid email configuration")?);

    let scheduler = SourceScheduler::new(
        fetcher,
        ledger.clone(),
        mailer,
        RetryPolicy::default(),
    )?;

    if args.once {
        info!("One-shot mode: polling every source once");
        scheduler.run_once(&sources).await;
    } else {
        tokio::select! {
            _ = scheduler.run(sources) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
            }
        }
    }

    ledger.close().await;
    info!("feed-mailer stopped");
    Ok(())
}
