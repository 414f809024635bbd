//! Reconciles a fresh extraction against a source's active snapshot.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use immo_core::{
    ListingContent, ListingRecord, NewListing, RawListing, RunStatus, ScrapeRun, SourceId,
};
use immo_storage::{
    history_snapshot, CommitReceipt, ListingChange, ReconciliationCommit, RecordStore, StoreError,
};
use tracing::{debug, info};

use crate::fingerprint::Fingerprinter;

/// Length of the fingerprint prefix used in synthetic listing URLs.
const SYNTHETIC_URL_HASH_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationCounts {
    pub found: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub changes: Vec<ListingChange>,
    pub counts: ReconciliationCounts,
}

struct Fresh {
    fingerprint: String,
    url: String,
    content: ListingContent,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotDiffer;

impl SnapshotDiffer {
    /// Listings without a detail link are keyed by the page they were found on
    /// plus a fingerprint prefix.
    pub fn listing_url(raw: &RawListing, fingerprint: &str, page_url: &str) -> String {
        match raw.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(link) => link.to_string(),
            None => {
                let prefix = &fingerprint[..fingerprint.len().min(SYNTHETIC_URL_HASH_LEN)];
                format!("{page_url}#{prefix}")
            }
        }
    }

    /// Pure planning step.
    ///
    /// A fresh item is matched to an active record by fingerprint first
    /// (preferring one at the same URL), then by URL alone. Matched records are
    /// updated when any content field drifted; only a price change produces a
    /// history entry. Unmatched items are created. Active records whose URL is
    /// absent from the batch are removed.
    pub fn plan(
        &self,
        active: &[ListingRecord],
        fresh: &[RawListing],
        page_url: &str,
        source_id: SourceId,
        now: DateTime<Utc>,
    ) -> ReconciliationPlan {
        let fresh: Vec<Fresh> = fresh
            .iter()
            .map(|raw| {
                let content = ListingContent::from_raw(raw);
                let fingerprint = Fingerprinter::fingerprint(&content);
                let url = Self::listing_url(raw, &fingerprint, page_url);
                Fresh {
                    fingerprint,
                    url,
                    content,
                }
            })
            .collect();

        let mut working: Vec<ListingRecord> = active.to_vec();
        let mut by_fingerprint: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut by_url: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, record) in active.iter().enumerate() {
            by_fingerprint.entry(&record.fingerprint).or_default().push(i);
            by_url.entry(&record.source_url).or_default().push(i);
        }

        let mut claimed: HashSet<usize> = HashSet::new();
        let mut seen_urls: HashSet<&str> = HashSet::new();
        let mut created: Vec<NewListing> = Vec::new();
        let mut handled: HashSet<(&str, &str)> = HashSet::new();

        for item in &fresh {
            seen_urls.insert(item.url.as_str());
            // the same element listed twice on one page
            if !handled.insert((item.fingerprint.as_str(), item.url.as_str())) {
                debug!(url = %item.url, "skipping repeated element");
                continue;
            }

            let free = |ids: Option<&Vec<usize>>| -> Vec<usize> {
                ids.into_iter()
                    .flatten()
                    .copied()
                    .filter(|i| !claimed.contains(i))
                    .collect()
            };
            let by_fp = free(by_fingerprint.get(item.fingerprint.as_str()));
            let matched = by_fp
                .iter()
                .copied()
                .find(|i| active[*i].source_url == item.url)
                .or_else(|| by_fp.first().copied())
                .or_else(|| free(by_url.get(item.url.as_str())).first().copied());

            match matched {
                Some(i) => {
                    claimed.insert(i);
                    let record = &mut working[i];
                    record.fingerprint = item.fingerprint.clone();
                    record.source_url = item.url.clone();
                    record.content = item.content.clone();
                    record.quality_score = item.content.quality_score();
                }
                None => created.push(NewListing {
                    fingerprint: item.fingerprint.clone(),
                    quality_score: item.content.quality_score(),
                    content: item.content.clone(),
                    source_id,
                    source_url: item.url.clone(),
                    created_at: now,
                }),
            }
        }

        let mut plan = ReconciliationPlan::default();
        plan.counts.found = fresh.len();
        for (original, current) in active.iter().zip(&working) {
            let drifted = original.content != current.content
                || original.fingerprint != current.fingerprint
                || original.source_url != current.source_url;
            if !drifted {
                continue;
            }
            let history = (original.content.price != current.content.price).then(|| {
                (
                    history_snapshot(&original.content),
                    history_snapshot(&current.content),
                )
            });
            plan.counts.updated += 1;
            plan.changes.push(ListingChange::Update {
                id: current.id,
                fingerprint: current.fingerprint.clone(),
                content: current.content.clone(),
                source_url: current.source_url.clone(),
                quality_score: current.quality_score,
                history,
            });
        }

        for (i, record) in working.iter().enumerate() {
            if !claimed.contains(&i) && !seen_urls.contains(record.source_url.as_str()) {
                plan.counts.removed += 1;
                plan.changes.push(ListingChange::Remove { id: record.id });
            }
        }

        plan.counts.created = created.len();
        plan.changes
            .extend(created.into_iter().map(ListingChange::Create));
        plan
    }

    /// Plans against the stored snapshot and commits the result together with
    /// a successful run log.
    pub async fn reconcile(
        &self,
        store: &dyn RecordStore,
        source_id: SourceId,
        fresh: &[RawListing],
        page_url: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(ReconciliationCounts, CommitReceipt), StoreError> {
        let active = store.active_listings_for_source(source_id).await?;
        let now = Utc::now();
        let plan = self.plan(&active, fresh, page_url, source_id, now);

        let mut run = ScrapeRun::new(source_id, RunStatus::Success, started_at);
        run.listings_found = plan.counts.found;
        run.listings_new = plan.counts.created;
        run.listings_updated = plan.counts.updated;
        run.listings_removed = plan.counts.removed;
        run.finished_at = now;

        let receipt = store
            .commit_reconciliation(ReconciliationCommit {
                source_id,
                changes: plan.changes,
                run,
                committed_at: now,
            })
            .await?;
        info!(
            source_id = %source_id,
            found = plan.counts.found,
            created = plan.counts.created,
            updated = plan.counts.updated,
            removed = plan.counts.removed,
            "snapshot reconciled"
        );
        Ok((plan.counts, receipt))
    }
}
