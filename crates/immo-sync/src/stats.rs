//! Per-locality market rollups, recomputed wholesale.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use immo_core::{ListingRecord, MarketRollup};
use immo_storage::{RecordStore, StoreError};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct StatisticsAggregator;

impl StatisticsAggregator {
    /// Groups canonical listings by postal code. Localities with no active
    /// listing are left out. Price statistics use active priced listings; the
    /// median is the element at index `n / 2` of the ascending prices.
    pub fn compute(&self, listings: &[ListingRecord], now: DateTime<Utc>) -> Vec<MarketRollup> {
        let mut by_locality: BTreeMap<&str, Vec<&ListingRecord>> = BTreeMap::new();
        for record in listings.iter().filter(|r| r.is_canonical()) {
            if let Some(postal_code) = record.content.postal_code.as_deref() {
                by_locality.entry(postal_code).or_default().push(record);
            }
        }

        by_locality
            .into_iter()
            .filter_map(|(postal_code, records)| rollup(postal_code, &records, now))
            .collect()
    }

    pub async fn recompute(
        &self,
        store: &dyn RecordStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<MarketRollup>, StoreError> {
        let listings = store.listings().await?;
        let rollups = self.compute(&listings, now);
        store.replace_rollups(rollups.clone()).await?;
        info!(localities = rollups.len(), listings = listings.len(), "market rollups recomputed");
        Ok(rollups)
    }
}

/// Integer mean, accumulated in u128.
fn mean(values: &[u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let total: u128 = values.iter().map(|v| u128::from(*v)).sum();
    // the mean of u64 values always fits in u64
    Some((total / values.len() as u128) as u64)
}

fn rollup(postal_code: &str, records: &[&ListingRecord], now: DateTime<Utc>) -> Option<MarketRollup> {
    let active: Vec<&ListingRecord> = records.iter().copied().filter(|r| r.is_active).collect();
    if active.is_empty() {
        return None;
    }

    let mut prices: Vec<u64> = active.iter().filter_map(|r| r.content.price).collect();
    prices.sort_unstable();
    let average_price = mean(&prices);

    let per_sqm: Vec<u64> = active
        .iter()
        .filter_map(|r| match (r.content.price, r.content.surface) {
            (Some(price), Some(surface)) if surface > 0 => Some(price / u64::from(surface)),
            _ => None,
        })
        .collect();
    let average_price_per_sqm = mean(&per_sqm);

    let mut type_counts = BTreeMap::new();
    for record in &active {
        if let Some(kind) = record.content.property_type {
            *type_counts.entry(kind).or_insert(0) += 1;
        }
    }

    let added_since = |window: Duration| {
        records
            .iter()
            .filter(|r| r.created_at >= now - window)
            .count()
    };

    Some(MarketRollup {
        postal_code: postal_code.to_string(),
        city: records.iter().find_map(|r| r.content.city.clone()),
        total_listings: records.len(),
        active_listings: active.len(),
        average_price,
        median_price: prices.get(prices.len() / 2).copied(),
        price_min: prices.first().copied(),
        price_max: prices.last().copied(),
        average_price_per_sqm,
        type_counts,
        added_last_day: added_since(Duration::days(1)),
        added_last_week: added_since(Duration::days(7)),
        added_last_month: added_since(Duration::days(30)),
        computed_at: now,
    })
}
