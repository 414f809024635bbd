//! Crawl orchestration: reconciliation, duplicate cleanup, rollups, alerts,
//! scheduling and market exports.

use std::sync::Arc;

use anyhow::Result;
use immo_storage::{Fetcher, HttpFetcher, PolitenessGate, RecordStore};

pub mod config;
pub mod diff;
pub mod engine;
pub mod export;
pub mod fingerprint;
pub mod notify;
pub mod schedule;
pub mod stats;

pub use config::{
    AgencyEntry, DomainPolicy, MarketplaceSelection, SourcesFile, SyncConfig, REGISTRY_TAG,
};
pub use diff::{ReconciliationCounts, ReconciliationPlan, SnapshotDiffer};
pub use engine::{BatchReport, ScrapeEngine, ScrapeError, ScrapeOutcome, STALE_AFTER};
pub use export::{export_market, ExportManifest, ExportManifestFile};
pub use fingerprint::{
    are_likely_duplicates, plan_cleanup, run_cleanup, CleanupPlan, CleanupReport, Fingerprinter,
};
pub use notify::{AlertDelivery, AlertNotifier, LogDelivery, NotificationService, SearchAlert};
pub use schedule::{Cadence, CadenceCrons, SchedulingLoop};
pub use stats::StatisticsAggregator;

pub const CRATE_NAME: &str = "immo-sync";

/// Wires an engine over the real HTTP fetcher: one politeness gate for the
/// process, per-domain overrides and alerts from the sources file.
pub async fn engine_from_config(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    sources: &SourcesFile,
) -> Result<ScrapeEngine> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.http_client())?);
    Ok(engine_with_fetcher(config, store, sources, fetcher).await)
}

pub async fn engine_with_fetcher(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    sources: &SourcesFile,
    fetcher: Arc<dyn Fetcher>,
) -> ScrapeEngine {
    let gate = Arc::new(PolitenessGate::new(config.politeness(), fetcher.clone()));
    sources.apply_politeness(&gate).await;

    let mut engine = ScrapeEngine::new(store, gate, fetcher)
        .with_proxies(config.proxies.clone())
        .with_batching(config.batch_size, config.batch_pause);
    if !sources.alerts.is_empty() {
        engine = engine.with_notifier(Arc::new(AlertNotifier::new(
            sources.alerts.clone(),
            Arc::new(LogDelivery),
        )));
    }
    engine
}
