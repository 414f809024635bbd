//! Per-source scrape orchestration and batched crawls.
//!
//! A scrape claims its source, asks the politeness gate, fetches, detects,
//! extracts and reconciles. Whatever goes wrong in between, including a panic,
//! ends as a state transition plus a run log; nothing propagates to the caller
//! except store failures while doing that bookkeeping.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use immo_adapters::{FormatDetector, ListingExtractor};
use immo_core::{RunStatus, ScrapeRun, ScrapeStatus, Source, SourceId};
use immo_storage::{
    Denial, FetchError, Fetcher, Permit, PolitenessGate, ProxyRotation, RecordStore, StoreError,
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::diff::{ReconciliationCounts, SnapshotDiffer};
use crate::notify::NotificationService;

/// Sources not scraped for this long are picked up by the priority crawl.
pub const STALE_AFTER: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("policy denied: {0}")]
    PolicyDenied(Denial),
    #[error(transparent)]
    FetchFailed(#[from] FetchError),
    #[error("no listings extracted from {url}")]
    ExtractionEmpty { url: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeOutcome {
    /// The source was disabled, blocked or already being scraped.
    NotClaimed,
    Skipped { reason: String },
    Succeeded(ReconciliationCounts),
    Failed { error: String, blocked: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_claimed: usize,
    pub created: usize,
    pub removed: usize,
}

impl BatchReport {
    fn absorb(&mut self, outcome: &ScrapeOutcome) {
        self.attempted += 1;
        match outcome {
            ScrapeOutcome::NotClaimed => self.not_claimed += 1,
            ScrapeOutcome::Skipped { .. } => self.skipped += 1,
            ScrapeOutcome::Succeeded(counts) => {
                self.succeeded += 1;
                self.created += counts.created;
                self.removed += counts.removed;
            }
            ScrapeOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct ScrapeEngine {
    store: Arc<dyn RecordStore>,
    gate: Arc<PolitenessGate>,
    fetcher: Arc<dyn Fetcher>,
    detector: FormatDetector,
    extractor: ListingExtractor,
    differ: SnapshotDiffer,
    notifier: Option<Arc<dyn NotificationService>>,
    proxies: ProxyRotation,
    batch_size: usize,
    batch_pause: Duration,
}

impl ScrapeEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gate: Arc<PolitenessGate>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            store,
            gate,
            fetcher,
            detector: FormatDetector::default(),
            extractor: ListingExtractor::new(),
            differ: SnapshotDiffer,
            notifier: None,
            proxies: ProxyRotation::default(),
            batch_size: 10,
            batch_pause: Duration::from_secs(5),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationService>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = ProxyRotation::new(proxies);
        self
    }

    pub fn with_batching(mut self, batch_size: usize, batch_pause: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_pause = batch_pause;
        self
    }

    pub fn with_detector(mut self, detector: FormatDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<PolitenessGate> {
        &self.gate
    }

    pub async fn scrape_source(&self, id: SourceId) -> Result<ScrapeOutcome, StoreError> {
        let started_at = Utc::now();
        let Some(claim) = self.store.claim_source(id, started_at).await? else {
            debug!(source_id = %id, "source not claimed, skipping");
            return Ok(ScrapeOutcome::NotClaimed);
        };

        let span = info_span!(
            "scrape_source",
            source_id = %id,
            domain = %claim.source.domain,
            url = %claim.source.website_url
        );
        let attempt = AssertUnwindSafe(self.run_claimed(&claim.source, started_at).instrument(span))
            .catch_unwind()
            .await;

        let error = match attempt {
            Ok(Ok(counts)) => return Ok(ScrapeOutcome::Succeeded(counts)),
            Ok(Err(ScrapeError::PolicyDenied(denial))) => {
                let reason = denial.to_string();
                info!(source_id = %id, %reason, "scrape skipped");
                let mut run = ScrapeRun::new(id, RunStatus::Skipped, started_at);
                run.error = Some(reason.clone());
                self.store.release_source(claim, run).await?;
                return Ok(ScrapeOutcome::Skipped { reason });
            }
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("scrape panicked: {}", panic_message(panic.as_ref())),
        };

        let mut run = ScrapeRun::new(id, RunStatus::Failed, started_at);
        run.error = Some(error.clone());
        let source = self.store.record_failure(id, error.clone(), run).await?;
        let blocked = source.status == ScrapeStatus::Blocked;
        warn!(source_id = %id, %error, failures = source.error_count, blocked, "scrape failed");
        Ok(ScrapeOutcome::Failed { error, blocked })
    }

    async fn run_claimed(
        &self,
        source: &Source,
        started_at: DateTime<Utc>,
    ) -> Result<ReconciliationCounts, ScrapeError> {
        let url = source.website_url.as_str();
        if let Permit::Denied(denial) = self.gate.permit(url).await {
            return Err(ScrapeError::PolicyDenied(denial));
        }

        let domain = PolitenessGate::domain_of(url).unwrap_or_else(|| source.domain.clone());
        self.gate.wait_before_request(&domain).await;
        let page = match self.fetcher.fetch(url, self.proxies.next_proxy()).await {
            Ok(page) => {
                self.gate.report_outcome(&domain, Some(page.status), "").await;
                page
            }
            Err(err) => {
                self.gate
                    .report_outcome(&domain, err.http_status(), &err.detail())
                    .await;
                return Err(err.into());
            }
        };

        let detection = self.detector.detect(&page.final_url, &page.body);
        let fresh = self
            .extractor
            .extract(&page.body, &page.final_url, &detection.selectors);
        debug!(
            platform = %detection.platform,
            selectors = detection.selectors.len(),
            extracted = fresh.len(),
            "page processed"
        );
        if fresh.is_empty() {
            return Err(ScrapeError::ExtractionEmpty {
                url: page.final_url,
            });
        }

        let (counts, receipt) = self
            .differ
            .reconcile(self.store.as_ref(), source.id, &fresh, url, started_at)
            .await?;

        if let Some(notifier) = &self.notifier {
            for listing in receipt.created.iter().filter(|l| l.is_canonical()) {
                match notifier.notify_matching_alerts(listing).await {
                    Ok(0) => {}
                    Ok(matched) => debug!(listing = %listing.id, matched, "alerts notified"),
                    Err(err) => warn!(listing = %listing.id, error = %err, "alert notification failed"),
                }
            }
        }
        Ok(counts)
    }

    /// Scrapes `ids` in groups of `batch_size`, pausing between groups. A
    /// failure in one source never affects its siblings.
    pub async fn run_batch(&self, ids: &[SourceId]) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, chunk) in ids.chunks(self.batch_size).enumerate() {
            if index > 0 && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
            let outcomes = join_all(chunk.iter().map(|id| self.scrape_source(*id))).await;
            for (id, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(outcome) => report.absorb(&outcome),
                    Err(err) => {
                        error!(source_id = %id, error = %err, "scrape bookkeeping failed");
                        report.attempted += 1;
                        report.failed += 1;
                    }
                }
            }
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            not_claimed = report.not_claimed,
            "batch finished"
        );
        report
    }

    /// Every enabled, unblocked source.
    pub async fn full_crawl(&self) -> Result<BatchReport, StoreError> {
        let ids = self
            .store
            .sources()
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.status != ScrapeStatus::Blocked)
            .map(|s| s.id)
            .collect::<Vec<_>>();
        info!(sources = ids.len(), "full crawl starting");
        Ok(self.run_batch(&ids).await)
    }

    /// Enabled, unblocked sources never scraped or last scraped over 24h ago.
    pub async fn priority_crawl(&self, now: DateTime<Utc>) -> Result<BatchReport, StoreError> {
        let ids = self
            .store
            .sources()
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.status != ScrapeStatus::Blocked)
            .filter(|s| s.last_scraped.map_or(true, |at| at < now - STALE_AFTER))
            .map(|s| s.id)
            .collect::<Vec<_>>();
        info!(sources = ids.len(), "priority crawl starting");
        Ok(self.run_batch(&ids).await)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
