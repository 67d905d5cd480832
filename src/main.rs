mod blobstore;
mod config;
mod dataset;
mod db;
mod error;
mod fetch;
mod lister;
mod pipeline;
mod publish;
mod render;
mod retry;
mod thumbnail;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::blobstore::CatboxStore;
use crate::config::Config;
use crate::fetch::HttpAssetFetcher;
use crate::lister::TemplateLister;
use crate::pipeline::{PipelineCoordinator, RunSummary};
use crate::publish::BlobPublisher;
use crate::render::{PageRenderer, SpiderRenderer};
use crate::thumbnail::FfmpegExtractor;

#[derive(Parser)]
#[command(name = "capcut_scraper", about = "CapCut template scraper and publisher")]
struct Cli {
    /// Concurrent descriptor chains
    #[arg(short = 'c', long, global = true)]
    concurrency: Option<usize>,
    /// Dedup ledger database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Output dataset CSV path
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for templates and queue new ids in the ledger
    Discover {
        /// Search queries, one discovery pass each
        #[arg(required = true)]
        queries: Vec<String>,
        /// Max templates to discover per query
        #[arg(short = 'm', long, default_value = "20")]
        max: usize,
    },
    /// Fetch, thumbnail and publish everything the ledger considers due
    Process {
        /// Max descriptors to process (default: all due)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Discover + process in one pass
    Run {
        #[arg(required = true)]
        queries: Vec<String>,
        /// Max templates to discover per query
        #[arg(short = 'm', long, default_value = "20")]
        max: usize,
        /// Max descriptors to process after discovery
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show ledger statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut cfg = Config::default();
    if let Some(c) = cli.concurrency {
        cfg.concurrency = c;
    }
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }
    if let Some(output) = cli.output {
        cfg.dataset_path = output;
    }

    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Discover { queries, max } => {
            let inserted = discover(&conn, &cfg, &queries, max).await?;
            println!("Queued {} new template(s) from {} query(ies)", inserted, queries.len());
            Ok(())
        }
        Commands::Process { limit } => {
            let summary = process(&conn, &cfg, limit).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Run { queries, max, limit } => {
            let t_discover = Instant::now();
            let inserted = discover(&conn, &cfg, &queries, max).await?;
            println!(
                "Queued {} new template(s) in {:.1}s",
                inserted,
                t_discover.elapsed().as_secs_f64()
            );

            let summary = process(&conn, &cfg, limit).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn, cfg.max_descriptor_attempts)?;
            println!("Total:            {}", s.total);
            println!("Pending:          {}", s.pending);
            println!("Done:             {}", s.done);
            println!("Partial:          {}", s.partial);
            println!("Failed (retry):   {}", s.failed_retryable);
            println!("Failed (final):   {}", s.failed_terminal);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn discover(
    conn: &rusqlite::Connection,
    cfg: &Config,
    queries: &[String],
    max: usize,
) -> anyhow::Result<usize> {
    let renderer: Arc<dyn PageRenderer> = Arc::new(SpiderRenderer::from_env()?);
    let lister = TemplateLister::new(renderer, cfg);

    let mut inserted = 0;
    for query in queries {
        let descriptors = lister.list(query, max).await?;
        inserted += db::insert_discovered(conn, &descriptors)?;
    }
    Ok(inserted)
}

async fn process(
    conn: &rusqlite::Connection,
    cfg: &Config,
    limit: Option<usize>,
) -> anyhow::Result<RunSummary> {
    let renderer: Arc<dyn PageRenderer> = Arc::new(SpiderRenderer::from_env()?);
    let store = Arc::new(CatboxStore::new(cfg.network_timeout)?);

    let coordinator = PipelineCoordinator::new(
        cfg.clone(),
        Arc::new(HttpAssetFetcher::new(renderer, cfg.clone())?),
        Arc::new(FfmpegExtractor::new(cfg)),
        Arc::new(BlobPublisher::new(store, cfg)),
    );

    // First Ctrl-C stops dispatch; in-flight chains finish their current
    // stage and everything undispatched stays pending for the next run.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling: finishing in-flight work...");
            let _ = cancel_tx.send(true);
        }
    });

    coordinator.run(conn, limit, cancel_rx).await
}

fn print_summary(summary: &RunSummary) {
    if summary.processed == 0 && summary.skipped == 0 {
        println!("Nothing to process. Run 'discover' first, or all templates are published.");
        return;
    }
    println!(
        "Processed {}: {} done, {} partial, {} failed, {} retrying, {} skipped.",
        summary.processed,
        summary.done,
        summary.partial,
        summary.failed,
        summary.retrying,
        summary.skipped
    );
    if !summary.failed_ids.is_empty() {
        println!("Failed ids: {}", summary.failed_ids.join(", "));
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
