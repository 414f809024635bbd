//! Core domain model for the agency crawler: sources, listings, history and rollups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "immo-core";

/// Number of consecutive failed scrapes after which a source is blocked.
pub const BLOCK_AFTER_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Storage key of a listing. Assigned in creation order, so ordering by id is
/// ordering by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub u64);

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listing-{}", self.0)
    }
}

/// Scrape lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Pending,
    Active,
    Success,
    Failed,
    Blocked,
}

impl ScrapeStatus {
    /// Whether a new scrape may start from this status. `Active` is skipped so
    /// overlapping triggers never run the same source twice; `Blocked` waits for
    /// an operator.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// An agency website being crawled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub website_url: String,
    pub domain: String,
    pub discovered_from: BTreeSet<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub enabled: bool,
    pub status: ScrapeStatus,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_scraped: Option<DateTime<Utc>>,
    pub total_listings: usize,
    pub active_listings: usize,
    pub created_at: DateTime<Utc>,
}

/// Candidate source produced by a discovery feed, before admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub name: String,
    pub website_url: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub discovered_from: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Studio,
    Land,
    Commercial,
    Other,
}

impl PropertyType {
    /// Title keyword heuristic, checked in a fixed order.
    pub fn from_title(title: &str) -> Self {
        let lower = title.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["studio"]) {
            Self::Studio
        } else if has(&["maison", "house", "villa"]) {
            Self::House
        } else if has(&["appartement", "apartment", "appart"]) {
            Self::Apartment
        } else if has(&["terrain", "land"]) {
            Self::Land
        } else if has(&["commercial", "local", "bureau"]) {
            Self::Commercial
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apartment => "apartment",
            Self::House => "house",
            Self::Studio => "studio",
            Self::Land => "land",
            Self::Commercial => "commercial",
            Self::Other => "other",
        }
    }
}

/// Extractor output for one listing element. Numeric fields hold digit strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub price: String,
    pub surface: Option<String>,
    pub rooms: Option<String>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub address: Option<String>,
    pub contact: Option<String>,
    /// Absolute detail-page URL, when the element links to one.
    pub link: Option<String>,
    pub coordinates: Option<Coordinates>,
}

/// Content fields of a listing, shared by fresh extractions and stored records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingContent {
    pub title: String,
    pub description: Option<String>,
    pub price: Option<u64>,
    pub surface: Option<u32>,
    pub rooms: Option<u32>,
    pub property_type: Option<PropertyType>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub photos: Vec<String>,
    pub features: BTreeMap<String, String>,
}

impl ListingContent {
    pub fn from_raw(raw: &RawListing) -> Self {
        let (postal_code, city) = raw
            .address
            .as_deref()
            .map(parse_postal_locality)
            .unwrap_or((None, None));

        let mut features = BTreeMap::new();
        if let Some(contact) = &raw.contact {
            features.insert("contact".to_string(), contact.clone());
        }
        let lower_title = raw.title.to_lowercase();
        let operation = if ["location", "louer", "rent"]
            .iter()
            .any(|n| lower_title.contains(n))
        {
            "rental"
        } else {
            "sale"
        };
        features.insert("operation".to_string(), operation.to_string());

        Self {
            title: raw.title.clone(),
            description: raw.description.clone(),
            price: raw.price.parse().ok(),
            surface: raw.surface.as_deref().and_then(|s| s.parse().ok()),
            rooms: raw.rooms.as_deref().and_then(|s| s.parse().ok()),
            property_type: Some(PropertyType::from_title(&raw.title)),
            address: raw.address.clone(),
            postal_code,
            city,
            coordinates: raw.coordinates,
            photos: raw.images.clone(),
            features,
        }
    }

    /// Completeness score in [0, 1]: title, price, surface and address weigh 2,
    /// a description longer than 50 characters and at least one photo weigh 1.
    pub fn quality_score(&self) -> f64 {
        let mut score = 0u32;
        if !self.title.trim().is_empty() {
            score += 2;
        }
        if self.price.is_some() {
            score += 2;
        }
        if self.surface.is_some() {
            score += 2;
        }
        if self.address.as_deref().is_some_and(|a| !a.trim().is_empty()) {
            score += 2;
        }
        if self
            .description
            .as_deref()
            .is_some_and(|d| d.chars().count() > 50)
        {
            score += 1;
        }
        if !self.photos.is_empty() {
            score += 1;
        }
        f64::from(score) / 10.0
    }
}

/// Pulls a French-style 5-digit postal code out of an address, plus the words
/// following it as the city.
pub fn parse_postal_locality(address: &str) -> (Option<String>, Option<String>) {
    let chars: Vec<char> = address.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if i - start != 5 {
            continue;
        }
        let postal: String = chars[start..i].iter().collect();
        let rest: String = chars[i..].iter().collect();
        let city = rest
            .split(|c: char| c == ',' || c == '-' || c == '(')
            .next()
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|s| !s.is_empty());
        return (Some(postal), city);
    }
    (None, None)
}

/// Persisted listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: ListingId,
    /// Re-identification key across crawls; not unique in storage.
    pub fingerprint: String,
    #[serde(flatten)]
    pub content: ListingContent,
    pub source_id: SourceId,
    pub source_url: String,
    pub is_active: bool,
    pub duplicate_of: Option<ListingId>,
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn is_canonical(&self) -> bool {
        self.duplicate_of.is_none()
    }
}

/// Listing about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub fingerprint: String,
    pub content: ListingContent,
    pub source_id: SourceId,
    pub source_url: String,
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
}

pub type FieldSnapshot = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// Append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: u64,
    pub listing_id: ListingId,
    pub kind: ChangeKind,
    pub before: Option<FieldSnapshot>,
    pub after: Option<FieldSnapshot>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Skipped,
}

/// One orchestration cycle for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub run_id: Uuid,
    pub source_id: SourceId,
    pub status: RunStatus,
    pub listings_found: usize,
    pub listings_new: usize,
    pub listings_updated: usize,
    pub listings_removed: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScrapeRun {
    pub fn new(source_id: SourceId, status: RunStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id,
            status,
            listings_found: 0,
            listings_new: 0,
            listings_updated: 0,
            listings_removed: 0,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Per-locality market aggregate, always recomputed from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRollup {
    pub postal_code: String,
    pub city: Option<String>,
    pub total_listings: usize,
    pub active_listings: usize,
    pub average_price: Option<u64>,
    pub median_price: Option<u64>,
    pub price_min: Option<u64>,
    pub price_max: Option<u64>,
    pub average_price_per_sqm: Option<u64>,
    pub type_counts: BTreeMap<PropertyType, usize>,
    pub added_last_day: usize,
    pub added_last_week: usize,
    pub added_last_month: usize,
    pub computed_at: DateTime<Utc>,
}
