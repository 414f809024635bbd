use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use immo_adapters::{
    admit_candidates, AdmissionReport, DiscoverySource, MarketplaceDiscovery, StaticDiscovery,
};
use immo_storage::MemoryRecordStore;
use immo_sync::{
    engine_from_config, export_market, run_cleanup, CadenceCrons, SchedulingLoop, SourcesFile,
    StatisticsAggregator, SyncConfig, REGISTRY_TAG,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often `schedule` persists the state snapshot between cadences.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "immo-cli")]
#[command(about = "Real estate agency crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Admit registry sources, crawl them and refresh rollups.
    Sync {
        /// Only crawl sources not scraped in the last 24h.
        #[arg(long)]
        priority: bool,
    },
    /// Run every cadence on its cron until interrupted.
    Schedule,
    /// Recompute market rollups.
    Stats,
    /// Mark exact and likely duplicate listings.
    Cleanup,
    /// Admit sources from the registry file and marketplaces.
    Discover,
    /// Write parquet market snapshots.
    Export,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Arc::new(
        MemoryRecordStore::load_snapshot(&config.state_file)
            .await
            .with_context(|| format!("loading {}", config.state_file.display()))?,
    );

    match cli.command.unwrap_or(Commands::Sync { priority: false }) {
        Commands::Sync { priority } => {
            let sources = load_sources(&config.sources_file).await?;
            discover(&store, &sources).await?;
            let engine = engine_from_config(&config, store.clone(), &sources).await?;
            let report = if priority {
                engine.priority_crawl(Utc::now()).await?
            } else {
                engine.full_crawl().await?
            };
            let rollups = StatisticsAggregator.recompute(store.as_ref(), Utc::now()).await?;
            println!(
                "sync complete: attempted={} succeeded={} failed={} skipped={} created={} removed={} localities={}",
                report.attempted,
                report.succeeded,
                report.failed,
                report.skipped,
                report.created,
                report.removed,
                rollups.len()
            );
        }
        Commands::Schedule => {
            let sources = load_sources(&config.sources_file).await?;
            discover(&store, &sources).await?;
            let engine = engine_from_config(&config, store.clone(), &sources).await?;
            let looped = SchedulingLoop::new(Arc::new(engine), CadenceCrons::from_config(&config));
            let mut sched = looped.build().await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, ctrl-c to stop");

            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = store.save_snapshot(&config.state_file).await {
                            warn!(error = %err, "periodic state snapshot failed");
                        }
                    }
                }
            }
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Stats => {
            let rollups = StatisticsAggregator.recompute(store.as_ref(), Utc::now()).await?;
            for rollup in &rollups {
                println!(
                    "{} {}: active={} total={} median={} avg/m2={}",
                    rollup.postal_code,
                    rollup.city.as_deref().unwrap_or("-"),
                    rollup.active_listings,
                    rollup.total_listings,
                    rollup.median_price.map_or("-".to_string(), |p| p.to_string()),
                    rollup
                        .average_price_per_sqm
                        .map_or("-".to_string(), |p| p.to_string()),
                );
            }
        }
        Commands::Cleanup => {
            let report = run_cleanup(store.as_ref()).await?;
            println!(
                "cleanup complete: scanned={} exact={} near={} marked={}",
                report.scanned, report.exact_duplicates, report.near_duplicates, report.marked
            );
        }
        Commands::Discover => {
            let sources = load_sources(&config.sources_file).await?;
            let report = discover(&store, &sources).await?;
            println!(
                "discovery complete: discovered={} admitted={} merged={} rejected={}",
                report.discovered, report.admitted, report.merged, report.rejected
            );
        }
        Commands::Export => {
            let manifest = export_market(store.as_ref(), &config.export_dir, Utc::now()).await?;
            println!("export complete: manifest={}", manifest.display());
        }
    }

    store
        .save_snapshot(&config.state_file)
        .await
        .with_context(|| format!("saving {}", config.state_file.display()))?;
    Ok(())
}

async fn load_sources(path: &Path) -> Result<SourcesFile> {
    if !path.exists() {
        warn!(path = %path.display(), "sources file not found, continuing with known sources only");
        return Ok(SourcesFile::default());
    }
    SourcesFile::load(path).await
}

async fn discover(store: &MemoryRecordStore, sources: &SourcesFile) -> Result<AdmissionReport> {
    let registry = StaticDiscovery::new(REGISTRY_TAG, sources.agency_candidates());
    let marketplaces = match &sources.marketplaces {
        Some(selection) if selection.keys.is_empty() => {
            Some(MarketplaceDiscovery::all(selection.postal_codes.clone()))
        }
        Some(selection) => {
            let keys: Vec<&str> = selection.keys.iter().map(String::as_str).collect();
            Some(MarketplaceDiscovery::only(&keys, selection.postal_codes.clone())?)
        }
        None => None,
    };

    let mut feeds: Vec<&dyn DiscoverySource> = vec![&registry];
    if let Some(marketplaces) = &marketplaces {
        feeds.push(marketplaces);
    }
    Ok(admit_candidates(store, &feeds).await?)
}
