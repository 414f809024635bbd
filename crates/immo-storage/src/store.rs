//! Record store for sources, listings, history, runs and rollups.
//!
//! Every write that belongs to one reconciliation is applied in a single
//! critical section: readers see either none of a commit or all of it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use immo_core::{
    ChangeEvent, ChangeKind, FieldSnapshot, ListingContent, ListingId, ListingRecord,
    MarketRollup, NewListing, ScrapeRun, ScrapeStatus, Source, SourceCandidate, SourceId,
    BLOCK_AFTER_FAILURES,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("unknown listing {0}")]
    UnknownListing(ListingId),
    #[error("listing {listing} does not belong to {source_id}")]
    ForeignListing {
        listing: ListingId,
        source_id: SourceId,
    },
    #[error("state file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Exclusive right to scrape a source, returned by [`RecordStore::claim_source`].
#[derive(Debug, Clone)]
pub struct Claim {
    pub source: Source,
    pub previous_status: ScrapeStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListingChange {
    Create(NewListing),
    Update {
        id: ListingId,
        fingerprint: String,
        content: ListingContent,
        source_url: String,
        quality_score: f64,
        /// Before/after snapshot; only set when the change is worth a history entry.
        history: Option<(FieldSnapshot, FieldSnapshot)>,
    },
    Remove {
        id: ListingId,
    },
}

/// Everything one successful scrape writes.
#[derive(Debug, Clone)]
pub struct ReconciliationCommit {
    pub source_id: SourceId,
    pub changes: Vec<ListingChange>,
    pub run: ScrapeRun,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub created: Vec<ListingRecord>,
    pub source: Source,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a source, or merges the candidate's discovery tags into the
    /// source already registered under the same website URL. The flag is true
    /// when a new source was created.
    async fn admit_source(
        &self,
        candidate: SourceCandidate,
        domain: String,
        now: DateTime<Utc>,
    ) -> Result<(Source, bool), StoreError>;
    async fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError>;
    async fn source_by_url(&self, website_url: &str) -> Result<Option<Source>, StoreError>;
    async fn sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Moves a claimable source to `Active`. Returns `None` when the source is
    /// disabled, blocked or already being scraped.
    async fn claim_source(
        &self,
        id: SourceId,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, StoreError>;
    /// Gives a claim back without counting it as a failure, logging `run`.
    async fn release_source(&self, claim: Claim, run: ScrapeRun) -> Result<(), StoreError>;
    async fn record_failure(
        &self,
        id: SourceId,
        error: String,
        run: ScrapeRun,
    ) -> Result<Source, StoreError>;

    async fn active_listings_for_source(
        &self,
        id: SourceId,
    ) -> Result<Vec<ListingRecord>, StoreError>;
    async fn commit_reconciliation(
        &self,
        commit: ReconciliationCommit,
    ) -> Result<CommitReceipt, StoreError>;
    /// All listings in id (creation) order.
    async fn listings(&self) -> Result<Vec<ListingRecord>, StoreError>;
    async fn listing(&self, id: ListingId) -> Result<Option<ListingRecord>, StoreError>;
    async fn listings_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ListingRecord>, StoreError>;
    /// Applies `(duplicate, canonical)` pairs. Returns how many records changed.
    async fn mark_duplicates(&self, pairs: &[(ListingId, ListingId)]) -> Result<usize, StoreError>;

    async fn replace_rollups(&self, rollups: Vec<MarketRollup>) -> Result<(), StoreError>;
    async fn rollups(&self) -> Result<Vec<MarketRollup>, StoreError>;
    async fn change_events(
        &self,
        listing: Option<ListingId>,
    ) -> Result<Vec<ChangeEvent>, StoreError>;
    async fn scrape_runs(&self, source: Option<SourceId>) -> Result<Vec<ScrapeRun>, StoreError>;
}

/// Fields recorded in `updated` history entries.
pub fn history_snapshot(content: &ListingContent) -> FieldSnapshot {
    let mut snapshot = FieldSnapshot::new();
    snapshot.insert("title".into(), json!(content.title));
    snapshot.insert("price".into(), json!(content.price));
    snapshot.insert("description".into(), json!(content.description));
    snapshot
}

fn creation_snapshot(record: &ListingRecord) -> FieldSnapshot {
    let mut snapshot = history_snapshot(&record.content);
    snapshot.insert("fingerprint".into(), json!(record.fingerprint));
    snapshot.insert("source_url".into(), json!(record.source_url));
    snapshot.insert("is_active".into(), json!(true));
    snapshot
}

fn activity_snapshot(active: bool) -> FieldSnapshot {
    let mut snapshot = FieldSnapshot::new();
    snapshot.insert("is_active".into(), json!(active));
    snapshot
}

fn url_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    next_source_id: u64,
    next_listing_id: u64,
    next_event_id: u64,
    sources: Vec<Source>,
    listings: Vec<ListingRecord>,
    events: Vec<ChangeEvent>,
    runs: Vec<ScrapeRun>,
    rollups: Vec<MarketRollup>,
}

#[derive(Debug, Default)]
struct State {
    next_source_id: u64,
    next_listing_id: u64,
    next_event_id: u64,
    sources: BTreeMap<SourceId, Source>,
    source_by_url: HashMap<String, SourceId>,
    listings: BTreeMap<ListingId, ListingRecord>,
    by_source: HashMap<SourceId, BTreeSet<ListingId>>,
    by_fingerprint: HashMap<String, BTreeSet<ListingId>>,
    events: Vec<ChangeEvent>,
    runs: Vec<ScrapeRun>,
    rollups: Vec<MarketRollup>,
}

impl State {
    fn from_persisted(persisted: PersistedState) -> Self {
        let mut state = Self {
            next_source_id: persisted.next_source_id,
            next_listing_id: persisted.next_listing_id,
            next_event_id: persisted.next_event_id,
            events: persisted.events,
            runs: persisted.runs,
            rollups: persisted.rollups,
            ..Default::default()
        };
        for source in persisted.sources {
            state
                .source_by_url
                .insert(url_key(&source.website_url), source.id);
            state.next_source_id = state.next_source_id.max(source.id.0);
            state.sources.insert(source.id, source);
        }
        for record in persisted.listings {
            state.next_listing_id = state.next_listing_id.max(record.id.0);
            state.index_listing(&record);
            state.listings.insert(record.id, record);
        }
        if let Some(last) = state.events.iter().map(|e| e.id).max() {
            state.next_event_id = state.next_event_id.max(last);
        }
        state
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            next_source_id: self.next_source_id,
            next_listing_id: self.next_listing_id,
            next_event_id: self.next_event_id,
            sources: self.sources.values().cloned().collect(),
            listings: self.listings.values().cloned().collect(),
            events: self.events.clone(),
            runs: self.runs.clone(),
            rollups: self.rollups.clone(),
        }
    }

    fn index_listing(&mut self, record: &ListingRecord) {
        self.by_source
            .entry(record.source_id)
            .or_default()
            .insert(record.id);
        self.by_fingerprint
            .entry(record.fingerprint.clone())
            .or_default()
            .insert(record.id);
    }

    fn push_event(
        &mut self,
        listing_id: ListingId,
        kind: ChangeKind,
        before: Option<FieldSnapshot>,
        after: Option<FieldSnapshot>,
        recorded_at: DateTime<Utc>,
    ) {
        self.next_event_id += 1;
        self.events.push(ChangeEvent {
            id: self.next_event_id,
            listing_id,
            kind,
            before,
            after,
            recorded_at,
        });
    }

    /// Earliest canonical record sharing `fingerprint`, other than `exclude`.
    fn canonical_for(&self, fingerprint: &str, exclude: ListingId) -> Option<ListingId> {
        self.by_fingerprint.get(fingerprint).and_then(|ids| {
            ids.iter()
                .copied()
                .filter(|id| *id != exclude)
                .find(|id| {
                    self.listings
                        .get(id)
                        .is_some_and(ListingRecord::is_canonical)
                })
        })
    }

    fn validate(&self, commit: &ReconciliationCommit) -> Result<(), StoreError> {
        if !self.sources.contains_key(&commit.source_id) {
            return Err(StoreError::UnknownSource(commit.source_id));
        }
        for change in &commit.changes {
            let id = match change {
                ListingChange::Create(_) => continue,
                ListingChange::Update { id, .. } | ListingChange::Remove { id } => *id,
            };
            let record = self
                .listings
                .get(&id)
                .ok_or(StoreError::UnknownListing(id))?;
            if record.source_id != commit.source_id {
                return Err(StoreError::ForeignListing {
                    listing: id,
                    source_id: commit.source_id,
                });
            }
        }
        Ok(())
    }

    fn apply(&mut self, change: ListingChange, at: DateTime<Utc>) -> Option<ListingRecord> {
        match change {
            ListingChange::Create(new) => {
                self.next_listing_id += 1;
                let id = ListingId(self.next_listing_id);
                let duplicate_of = self.canonical_for(&new.fingerprint, id);
                if let Some(canonical) = duplicate_of {
                    debug!(listing = %id, canonical = %canonical, "new listing shares a stored fingerprint");
                }
                let record = ListingRecord {
                    id,
                    fingerprint: new.fingerprint,
                    content: new.content,
                    source_id: new.source_id,
                    source_url: new.source_url,
                    is_active: true,
                    duplicate_of,
                    quality_score: new.quality_score,
                    created_at: new.created_at,
                    updated_at: new.created_at,
                };
                self.index_listing(&record);
                self.listings.insert(id, record.clone());
                self.push_event(
                    id,
                    ChangeKind::Created,
                    None,
                    Some(creation_snapshot(&record)),
                    at,
                );
                Some(record)
            }
            ListingChange::Update {
                id,
                fingerprint,
                content,
                source_url,
                quality_score,
                history,
            } => {
                let Some(previous_fingerprint) =
                    self.listings.get(&id).map(|r| r.fingerprint.clone())
                else {
                    return None;
                };
                let fingerprint_changed = previous_fingerprint != fingerprint;
                let mut duplicate_of = None;
                if fingerprint_changed {
                    if let Some(ids) = self.by_fingerprint.get_mut(&previous_fingerprint) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            self.by_fingerprint.remove(&previous_fingerprint);
                        }
                    }
                    self.by_fingerprint
                        .entry(fingerprint.clone())
                        .or_default()
                        .insert(id);
                    duplicate_of = self.canonical_for(&fingerprint, id).filter(|c| *c < id);
                }
                if let Some(record) = self.listings.get_mut(&id) {
                    // the old link described the old content
                    if fingerprint_changed {
                        record.duplicate_of = duplicate_of;
                    }
                    record.fingerprint = fingerprint;
                    record.content = content;
                    record.source_url = source_url;
                    record.quality_score = quality_score;
                    record.is_active = true;
                    record.updated_at = at;
                }
                if let Some((before, after)) = history {
                    self.push_event(id, ChangeKind::Updated, Some(before), Some(after), at);
                }
                None
            }
            ListingChange::Remove { id } => {
                if let Some(record) = self.listings.get_mut(&id) {
                    record.is_active = false;
                    record.updated_at = at;
                    self.push_event(
                        id,
                        ChangeKind::Removed,
                        Some(activity_snapshot(true)),
                        Some(activity_snapshot(false)),
                        at,
                    );
                }
                None
            }
        }
    }

    fn refresh_source_totals(&mut self, id: SourceId) {
        let (total, active) = self.by_source.get(&id).map_or((0, 0), |ids| {
            let active = ids
                .iter()
                .filter(|l| self.listings.get(l).is_some_and(|r| r.is_active))
                .count();
            (ids.len(), active)
        });
        if let Some(source) = self.sources.get_mut(&id) {
            source.total_listings = total;
            source.active_listings = active;
        }
    }
}

/// In-process store with an optional JSON snapshot on disk.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: RwLock<State>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot written by [`save_snapshot`](Self::save_snapshot). A
    /// missing file yields an empty store.
    pub async fn load_snapshot(path: &Path) -> Result<Self, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no state snapshot yet, starting empty");
                return Ok(Self::new());
            }
            Err(err) => return Err(err.into()),
        };
        let persisted: PersistedState = serde_json::from_slice(&bytes)?;
        info!(
            path = %path.display(),
            sources = persisted.sources.len(),
            listings = persisted.listings.len(),
            "state snapshot loaded"
        );
        Ok(Self {
            state: RwLock::new(State::from_persisted(persisted)),
        })
    }

    /// Writes the whole store as JSON via a temp file and rename.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&state.to_persisted())?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes).await?;
        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        debug!(path = %path.display(), bytes = bytes.len(), "state snapshot saved");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn admit_source(
        &self,
        candidate: SourceCandidate,
        domain: String,
        now: DateTime<Utc>,
    ) -> Result<(Source, bool), StoreError> {
        let mut state = self.state.write().await;
        let key = url_key(&candidate.website_url);
        if let Some(existing) = state.source_by_url.get(&key).copied() {
            let source = state
                .sources
                .get_mut(&existing)
                .ok_or(StoreError::UnknownSource(existing))?;
            source.discovered_from.extend(candidate.discovered_from);
            if source.address.is_none() {
                source.address = candidate.address;
            }
            if source.phone.is_none() {
                source.phone = candidate.phone;
            }
            if source.coordinates.is_none() {
                source.coordinates = candidate.coordinates;
            }
            return Ok((source.clone(), false));
        }

        state.next_source_id += 1;
        let id = SourceId(state.next_source_id);
        let source = Source {
            id,
            name: candidate.name,
            website_url: candidate.website_url,
            domain,
            discovered_from: candidate.discovered_from,
            address: candidate.address,
            phone: candidate.phone,
            coordinates: candidate.coordinates,
            enabled: true,
            status: ScrapeStatus::Pending,
            error_count: 0,
            last_error: None,
            last_scraped: None,
            total_listings: 0,
            active_listings: 0,
            created_at: now,
        };
        state.source_by_url.insert(key, id);
        state.sources.insert(id, source.clone());
        info!(source = %id, name = %source.name, url = %source.website_url, "source admitted");
        Ok((source, true))
    }

    async fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        Ok(self.state.read().await.sources.get(&id).cloned())
    }

    async fn source_by_url(&self, website_url: &str) -> Result<Option<Source>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .source_by_url
            .get(&url_key(website_url))
            .and_then(|id| state.sources.get(id))
            .cloned())
    }

    async fn sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.state.read().await.sources.values().cloned().collect())
    }

    async fn claim_source(
        &self,
        id: SourceId,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, StoreError> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .get_mut(&id)
            .ok_or(StoreError::UnknownSource(id))?;
        if !source.enabled || !source.status.is_claimable() {
            debug!(source = %id, status = %source.status, enabled = source.enabled, "source not claimable");
            return Ok(None);
        }
        let previous_status = source.status;
        source.status = ScrapeStatus::Active;
        source.last_scraped = Some(now);
        Ok(Some(Claim {
            source: source.clone(),
            previous_status,
        }))
    }

    async fn release_source(&self, claim: Claim, run: ScrapeRun) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let id = claim.source.id;
        let source = state
            .sources
            .get_mut(&id)
            .ok_or(StoreError::UnknownSource(id))?;
        if source.status == ScrapeStatus::Active {
            source.status = claim.previous_status;
        }
        state.runs.push(run);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: SourceId,
        error: String,
        run: ScrapeRun,
    ) -> Result<Source, StoreError> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .get_mut(&id)
            .ok_or(StoreError::UnknownSource(id))?;
        source.error_count += 1;
        source.last_error = Some(error);
        source.status = if source.error_count >= BLOCK_AFTER_FAILURES {
            warn!(source = %id, failures = source.error_count, "source blocked after repeated failures");
            ScrapeStatus::Blocked
        } else {
            ScrapeStatus::Failed
        };
        let source = source.clone();
        state.runs.push(run);
        Ok(source)
    }

    async fn active_listings_for_source(
        &self,
        id: SourceId,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_source
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|l| state.listings.get(l))
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    async fn commit_reconciliation(
        &self,
        commit: ReconciliationCommit,
    ) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.write().await;
        state.validate(&commit)?;

        let ReconciliationCommit {
            source_id,
            changes,
            run,
            committed_at,
        } = commit;
        let mut created = Vec::new();
        for change in changes {
            if let Some(record) = state.apply(change, committed_at) {
                created.push(record);
            }
        }
        state.runs.push(run);
        state.refresh_source_totals(source_id);

        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::UnknownSource(source_id))?;
        source.status = ScrapeStatus::Success;
        source.error_count = 0;
        source.last_error = None;
        Ok(CommitReceipt {
            created,
            source: source.clone(),
        })
    }

    async fn listings(&self) -> Result<Vec<ListingRecord>, StoreError> {
        Ok(self.state.read().await.listings.values().cloned().collect())
    }

    async fn listing(&self, id: ListingId) -> Result<Option<ListingRecord>, StoreError> {
        Ok(self.state.read().await.listings.get(&id).cloned())
    }

    async fn listings_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_fingerprint
            .get(fingerprint)
            .into_iter()
            .flatten()
            .filter_map(|id| state.listings.get(id))
            .cloned()
            .collect())
    }

    async fn mark_duplicates(&self, pairs: &[(ListingId, ListingId)]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        for (duplicate, canonical) in pairs {
            for id in [duplicate, canonical] {
                if !state.listings.contains_key(id) {
                    return Err(StoreError::UnknownListing(*id));
                }
            }
        }
        let mut changed = 0;
        for (duplicate, canonical) in pairs {
            if duplicate == canonical {
                continue;
            }
            if let Some(record) = state.listings.get_mut(duplicate) {
                if record.duplicate_of != Some(*canonical) {
                    record.duplicate_of = Some(*canonical);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn replace_rollups(&self, rollups: Vec<MarketRollup>) -> Result<(), StoreError> {
        self.state.write().await.rollups = rollups;
        Ok(())
    }

    async fn rollups(&self) -> Result<Vec<MarketRollup>, StoreError> {
        Ok(self.state.read().await.rollups.clone())
    }

    async fn change_events(
        &self,
        listing: Option<ListingId>,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| listing.map_or(true, |id| e.listing_id == id))
            .cloned()
            .collect())
    }

    async fn scrape_runs(&self, source: Option<SourceId>) -> Result<Vec<ScrapeRun>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| source.map_or(true, |id| r.source_id == id))
            .cloned()
            .collect())
    }
}
