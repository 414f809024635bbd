//! Content fingerprints and duplicate cleanup.

use std::collections::HashMap;

use immo_core::{ListingContent, ListingId, ListingRecord};
use immo_storage::{RecordStore, StoreError};
use sha2::{Digest, Sha256};
use tracing::info;

const DELIMITER: &str = "|";

pub struct Fingerprinter;

impl Fingerprinter {
    /// Lower-cases and collapses inner whitespace.
    pub fn normalize(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn fingerprint_parts(title: &str, price: &str, address: &str) -> String {
        let joined = [title, price, address]
            .iter()
            .map(|part| Self::normalize(part))
            .collect::<Vec<_>>()
            .join(DELIMITER);
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn fingerprint(content: &ListingContent) -> String {
        let price = content.price.map(|p| p.to_string()).unwrap_or_default();
        Self::fingerprint_parts(
            &content.title,
            &price,
            content.address.as_deref().unwrap_or_default(),
        )
    }
}

/// Looser than fingerprint equality: at least two of title, price and address
/// agree. Missing values never count as agreement.
pub fn are_likely_duplicates(a: &ListingContent, b: &ListingContent) -> bool {
    let same_text = |x: Option<&str>, y: Option<&str>| match (x, y) {
        (Some(x), Some(y)) => {
            let x = Fingerprinter::normalize(x);
            !x.is_empty() && x == Fingerprinter::normalize(y)
        }
        _ => false,
    };
    let title = same_text(Some(&a.title), Some(&b.title));
    let price = a.price.is_some() && a.price == b.price;
    let address = same_text(a.address.as_deref(), b.address.as_deref());
    [title, price, address].iter().filter(|m| **m).count() >= 2
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    /// `(duplicate, canonical)` pairs.
    pub pairs: Vec<(ListingId, ListingId)>,
    pub exact: usize,
    pub near: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    pub marked: usize,
}

/// Scans non-duplicate records in creation order. The first record seen with a
/// fingerprint is canonical; later ones become its duplicates. Remaining
/// records then go through the near-duplicate heuristic, bucketed by price and
/// by title so only plausible pairs are compared.
pub fn plan_cleanup(listings: &[ListingRecord]) -> CleanupPlan {
    let mut ordered: Vec<&ListingRecord> = listings.iter().filter(|r| r.is_canonical()).collect();
    ordered.sort_by_key(|r| r.id);

    let mut plan = CleanupPlan::default();
    let mut first_by_fingerprint: HashMap<&str, ListingId> = HashMap::new();
    let mut survivors = Vec::new();
    for record in ordered {
        match first_by_fingerprint.get(record.fingerprint.as_str()) {
            Some(canonical) => {
                plan.pairs.push((record.id, *canonical));
                plan.exact += 1;
            }
            None => {
                first_by_fingerprint.insert(&record.fingerprint, record.id);
                survivors.push(record);
            }
        }
    }

    let mut marked: HashMap<ListingId, ListingId> = HashMap::new();
    let bucket_keys: [fn(&ListingRecord) -> Option<String>; 2] = [
        |r| r.content.price.map(|p| p.to_string()),
        |r| Some(Fingerprinter::normalize(&r.content.title)).filter(|t| !t.is_empty()),
    ];
    for key_of in bucket_keys {
        let mut buckets: HashMap<String, Vec<&ListingRecord>> = HashMap::new();
        for record in survivors.iter().copied() {
            if marked.contains_key(&record.id) {
                continue;
            }
            let Some(key) = key_of(record) else {
                continue;
            };
            let bucket = buckets.entry(key).or_default();
            match bucket
                .iter()
                .find(|earlier| are_likely_duplicates(&earlier.content, &record.content))
            {
                Some(earlier) => {
                    marked.insert(record.id, earlier.id);
                    plan.pairs.push((record.id, earlier.id));
                    plan.near += 1;
                }
                None => bucket.push(record),
            }
        }
    }
    plan
}

pub async fn run_cleanup(store: &dyn RecordStore) -> Result<CleanupReport, StoreError> {
    let listings = store.listings().await?;
    let plan = plan_cleanup(&listings);
    let marked = store.mark_duplicates(&plan.pairs).await?;
    let report = CleanupReport {
        scanned: listings.len(),
        exact_duplicates: plan.exact,
        near_duplicates: plan.near,
        marked,
    };
    info!(
        scanned = report.scanned,
        exact = report.exact_duplicates,
        near = report.near_duplicates,
        marked = report.marked,
        "duplicate cleanup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use immo_core::SourceId;

    fn content(title: &str, price: Option<u64>, address: Option<&str>) -> ListingContent {
        ListingContent {
            title: title.into(),
            price,
            address: address.map(String::from),
            ..Default::default()
        }
    }

    fn record(id: u64, content: ListingContent) -> ListingRecord {
        ListingRecord {
            id: ListingId(id),
            fingerprint: Fingerprinter::fingerprint(&content),
            content,
            source_id: SourceId(1),
            source_url: format!("https://agence.example/{id}"),
            is_active: true,
            duplicate_of: None,
            quality_score: 0.4,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_ignores_case_and_spacing() {
        let a = content("Appartement  T3", Some(250_000), Some("3 rue des Lilas 69003 Lyon"));
        let b = content(" appartement t3 ", Some(250_000), Some("3 RUE DES LILAS\n69003 LYON"));
        assert_eq!(Fingerprinter::fingerprint(&a), Fingerprinter::fingerprint(&b));
        assert_eq!(Fingerprinter::fingerprint(&a).len(), 64);

        let c = content("Appartement T3", Some(255_000), Some("3 rue des Lilas 69003 Lyon"));
        assert_ne!(Fingerprinter::fingerprint(&a), Fingerprinter::fingerprint(&c));
    }

    #[test]
    fn fields_do_not_bleed_across_the_delimiter() {
        assert_ne!(
            Fingerprinter::fingerprint_parts("a", "1", "b"),
            Fingerprinter::fingerprint_parts("a1", "", "b")
        );
    }

    #[test]
    fn two_of_three_fields_make_a_likely_duplicate() {
        let base = content("Maison 5 pièces", Some(420_000), Some("Chemin des Vignes, 33000 Bordeaux"));
        let repriced = content("MAISON 5 pièces", Some(410_000), Some("chemin des vignes, 33000 bordeaux"));
        let retitled = content("Maison familiale", Some(420_000), Some("Chemin des Vignes, 33000 Bordeaux"));
        let only_price = content("Autre bien", Some(420_000), Some("Ailleurs"));
        assert!(are_likely_duplicates(&base, &repriced));
        assert!(are_likely_duplicates(&base, &retitled));
        assert!(!are_likely_duplicates(&base, &only_price));

        let no_address = content("Maison 5 pièces", None, None);
        assert!(!are_likely_duplicates(&no_address, &content("Maison 5 pièces", None, None)));
    }

    #[test]
    fn cleanup_keeps_the_earliest_record_canonical() {
        let shared = content("Studio centre", Some(98_000), Some("1 place Bellecour 69002 Lyon"));
        let near = content("Studio centre", Some(98_000), Some("Place Bellecour, Lyon"));
        let listings = vec![
            record(3, shared.clone()),
            record(1, shared.clone()),
            record(2, content("T2 vue Saône", Some(180_000), None)),
            record(4, near),
        ];
        let plan = plan_cleanup(&listings);
        assert_eq!(plan.exact, 1);
        assert_eq!(plan.near, 1);
        assert_eq!(
            plan.pairs,
            vec![(ListingId(3), ListingId(1)), (ListingId(4), ListingId(1))]
        );
    }
}
