//! Parquet market snapshots with a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use immo_core::{ListingRecord, MarketRollup};
use immo_storage::RecordStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes active canonical listings and the current rollups under
/// `<root>/<timestamp>/`. Returns the manifest path.
pub async fn export_market(
    store: &dyn RecordStore,
    root: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let listings: Vec<ListingRecord> = store
        .listings()
        .await
        .context("loading listings for export")?
        .into_iter()
        .filter(|l| l.is_active && l.is_canonical())
        .collect();
    let rollups = store.rollups().await.context("loading rollups for export")?;

    let snapshot_dir = root.join(now.format("%Y%m%dT%H%M%SZ").to_string());
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    let rollups_path = snapshot_dir.join("market_rollups.parquet");
    write_listings_parquet(&listings_path, &listings)?;
    write_rollups_parquet(&rollups_path, &rollups)?;

    let manifest = ExportManifest {
        schema_version: EXPORT_SCHEMA_VERSION,
        exported_at: now,
        files: vec![
            manifest_entry("listings", &snapshot_dir, &listings_path, listings.len())?,
            manifest_entry("market_rollups", &snapshot_dir, &rollups_path, rollups.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        listings = listings.len(),
        rollups = rollups.len(),
        path = %manifest_path.display(),
        "market export written"
    );
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, listings: &[ListingRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_id", DataType::UInt64, false),
        ArrowField::new("source_id", DataType::UInt64, false),
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("price", DataType::UInt64, true),
        ArrowField::new("surface", DataType::UInt32, true),
        ArrowField::new("rooms", DataType::UInt32, true),
        ArrowField::new("property_type", DataType::Utf8, true),
        ArrowField::new("postal_code", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("quality_score", DataType::Float64, false),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let ids = UInt64Array::from(listings.iter().map(|l| l.id.0).collect::<Vec<_>>());
    let source_ids = UInt64Array::from(listings.iter().map(|l| l.source_id.0).collect::<Vec<_>>());
    let fingerprints = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.fingerprint.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.content.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let prices = UInt64Array::from(listings.iter().map(|l| l.content.price).collect::<Vec<_>>());
    let surfaces = UInt32Array::from(listings.iter().map(|l| l.content.surface).collect::<Vec<_>>());
    let rooms = UInt32Array::from(listings.iter().map(|l| l.content.rooms).collect::<Vec<_>>());
    let property_types = StringArray::from(
        listings
            .iter()
            .map(|l| l.content.property_type.map(|t| t.as_str()))
            .collect::<Vec<_>>(),
    );
    let postal_codes = StringArray::from(
        listings
            .iter()
            .map(|l| l.content.postal_code.as_deref())
            .collect::<Vec<_>>(),
    );
    let cities = StringArray::from(
        listings
            .iter()
            .map(|l| l.content.city.as_deref())
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.source_url.as_str()))
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(listings.iter().map(|l| l.quality_score).collect::<Vec<_>>());
    let created = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(source_ids),
            Arc::new(fingerprints),
            Arc::new(titles),
            Arc::new(prices),
            Arc::new(surfaces),
            Arc::new(rooms),
            Arc::new(property_types),
            Arc::new(postal_codes),
            Arc::new(cities),
            Arc::new(urls),
            Arc::new(scores),
            Arc::new(created),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_rollups_parquet(path: &Path, rollups: &[MarketRollup]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("postal_code", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("total_listings", DataType::UInt64, false),
        ArrowField::new("active_listings", DataType::UInt64, false),
        ArrowField::new("average_price", DataType::UInt64, true),
        ArrowField::new("median_price", DataType::UInt64, true),
        ArrowField::new("price_min", DataType::UInt64, true),
        ArrowField::new("price_max", DataType::UInt64, true),
        ArrowField::new("average_price_per_sqm", DataType::UInt64, true),
        ArrowField::new("type_counts", DataType::Utf8, false),
        ArrowField::new("computed_at", DataType::Utf8, false),
    ]));

    let count = |f: fn(&MarketRollup) -> usize| {
        UInt64Array::from(rollups.iter().map(|r| f(r) as u64).collect::<Vec<_>>())
    };
    let price = |f: fn(&MarketRollup) -> Option<u64>| {
        UInt64Array::from(rollups.iter().map(f).collect::<Vec<_>>())
    };

    let postal_codes = StringArray::from(
        rollups
            .iter()
            .map(|r| Some(r.postal_code.as_str()))
            .collect::<Vec<_>>(),
    );
    let cities = StringArray::from(rollups.iter().map(|r| r.city.as_deref()).collect::<Vec<_>>());
    let type_counts = StringArray::from(
        rollups
            .iter()
            .map(|r| {
                Some(
                    r.type_counts
                        .iter()
                        .map(|(kind, n)| format!("{}={n}", kind.as_str()))
                        .collect::<Vec<_>>()
                        .join(","),
                )
            })
            .collect::<Vec<_>>(),
    );
    let computed = StringArray::from(
        rollups
            .iter()
            .map(|r| Some(r.computed_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(postal_codes),
            Arc::new(cities),
            Arc::new(count(|r| r.total_listings)),
            Arc::new(count(|r| r.active_listings)),
            Arc::new(price(|r| r.average_price)),
            Arc::new(price(|r| r.median_price)),
            Arc::new(price(|r| r.price_min)),
            Arc::new(price(|r| r.price_max)),
            Arc::new(price(|r| r.average_price_per_sqm)),
            Arc::new(type_counts),
            Arc::new(computed),
        ],
    )
    .context("building market_rollups record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use immo_core::{ListingContent, NewListing, RunStatus, ScrapeRun, SourceCandidate};
    use immo_storage::{ListingChange, MemoryRecordStore, ReconciliationCommit};
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn export_writes_parquet_and_manifest() {
        let store = MemoryRecordStore::new();
        let (source, _) = store
            .admit_source(
                SourceCandidate {
                    name: "Agence Vieux Port".into(),
                    website_url: "https://vieux-port.example".into(),
                    address: None,
                    phone: None,
                    coordinates: None,
                    discovered_from: BTreeSet::new(),
                },
                "vieux-port.example".into(),
                Utc::now(),
            )
            .await
            .unwrap();
        let content = ListingContent {
            title: "T4 vue mer".into(),
            price: Some(420_000),
            surface: Some(90),
            postal_code: Some("13007".into()),
            ..Default::default()
        };
        store
            .commit_reconciliation(ReconciliationCommit {
                source_id: source.id,
                changes: vec![ListingChange::Create(NewListing {
                    fingerprint: "fp".into(),
                    quality_score: content.quality_score(),
                    content,
                    source_id: source.id,
                    source_url: "https://vieux-port.example/t4".into(),
                    created_at: Utc::now(),
                })],
                run: ScrapeRun::new(source.id, RunStatus::Success, Utc::now()),
                committed_at: Utc::now(),
            })
            .await
            .unwrap();
        crate::stats::StatisticsAggregator
            .recompute(&store, Utc::now())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let manifest_path = export_market(&store, dir.path(), Utc::now()).await.unwrap();
        let manifest: ExportManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.schema_version, EXPORT_SCHEMA_VERSION);
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].rows, 1);
        assert_eq!(manifest.files[1].rows, 1);

        let snapshot_dir = manifest_path.parent().unwrap();
        for file in &manifest.files {
            let bytes = std::fs::read(snapshot_dir.join(&file.path)).unwrap();
            assert_eq!(bytes.len() as u64, file.bytes);
            assert_eq!(&bytes[..4], b"PAR1");
            assert_eq!(file.sha256.len(), 64);
        }
    }
}
