//! Parquet export of the deduplicated cache and the snapshot history.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use mlsync_core::ListingRecord;
use mlsync_storage::SnapshotPoint;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

pub const EXPORT_SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
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

/// Writes `listings.parquet`, `snapshots.parquet` and `manifest.json` into `out_dir`.
pub fn export_parquet(
    out_dir: &Path,
    listings: &[ListingRecord],
    snapshots: &[SnapshotPoint],
    generated_at: DateTime<Utc>,
) -> Result<(PathBuf, ExportManifest)> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let listings_path = out_dir.join("listings.parquet");
    let snapshots_path = out_dir.join("snapshots.parquet");
    write_listings_parquet(&listings_path, listings)?;
    write_snapshots_parquet(&snapshots_path, snapshots)?;

    let manifest = ExportManifest {
        schema_version: EXPORT_SCHEMA_VERSION,
        generated_at,
        files: vec![
            manifest_entry("listings", out_dir, &listings_path, listings.len())?,
            manifest_entry("snapshots", out_dir, &snapshots_path, snapshots.len())?,
        ],
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(
        dir = %out_dir.display(),
        listings = listings.len(),
        snapshots = snapshots.len(),
        "parquet export written"
    );
    Ok((manifest_path, manifest))
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
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("partition_key", DataType::Utf8, true),
        ArrowField::new("address", DataType::Utf8, false),
        ArrowField::new("unit_label", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("listing_type", DataType::Utf8, false),
        ArrowField::new("list_price", DataType::Float64, false),
        ArrowField::new("close_price", DataType::Float64, true),
        ArrowField::new("living_area", DataType::Float64, false),
        ArrowField::new("bedroom_count", DataType::UInt32, false),
        ArrowField::new("bathroom_count", DataType::Float64, false),
        ArrowField::new("price_per_sqft", DataType::Float64, true),
        ArrowField::new("origin", DataType::Utf8, false),
        ArrowField::new("modified_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(listings.iter().map(|r| Some(r.id.as_str())).collect::<Vec<_>>());
    let partitions = StringArray::from(
        listings
            .iter()
            .map(|r| r.partition_key.as_deref())
            .collect::<Vec<_>>(),
    );
    let addresses = StringArray::from(
        listings
            .iter()
            .map(|r| Some(r.address.as_str()))
            .collect::<Vec<_>>(),
    );
    let units = StringArray::from(
        listings
            .iter()
            .map(|r| Some(r.unit_label.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        listings
            .iter()
            .map(|r| Some(r.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let listing_types = StringArray::from(
        listings
            .iter()
            .map(|r| Some(format!("{:?}", r.listing_type)))
            .collect::<Vec<_>>(),
    );
    let list_prices = Float64Array::from(listings.iter().map(|r| r.list_price).collect::<Vec<_>>());
    let close_prices = Float64Array::from(listings.iter().map(|r| r.close_price).collect::<Vec<_>>());
    let areas = Float64Array::from(listings.iter().map(|r| r.living_area).collect::<Vec<_>>());
    let bedrooms = UInt32Array::from(listings.iter().map(|r| r.bedroom_count).collect::<Vec<_>>());
    let bathrooms = Float64Array::from(listings.iter().map(|r| r.bathroom_count).collect::<Vec<_>>());
    let per_sqft = Float64Array::from(listings.iter().map(|r| r.price_per_sqft).collect::<Vec<_>>());
    let origins = StringArray::from(
        listings
            .iter()
            .map(|r| Some(format!("{:?}", r.origin)))
            .collect::<Vec<_>>(),
    );
    let modified = StringArray::from(
        listings
            .iter()
            .map(|r| Some(r.modified_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(partitions),
            Arc::new(addresses),
            Arc::new(units),
            Arc::new(statuses),
            Arc::new(listing_types),
            Arc::new(list_prices),
            Arc::new(close_prices),
            Arc::new(areas),
            Arc::new(bedrooms),
            Arc::new(bathrooms),
            Arc::new(per_sqft),
            Arc::new(origins),
            Arc::new(modified),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_snapshots_parquet(path: &Path, points: &[SnapshotPoint]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("partition_key", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("list_price", DataType::Float64, false),
        ArrowField::new("close_price", DataType::Float64, true),
        ArrowField::new("captured_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(points.iter().map(|p| Some(p.id.as_str())).collect::<Vec<_>>());
    let partitions = StringArray::from(
        points
            .iter()
            .map(|p| p.partition_key.as_deref())
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(points.iter().map(|p| Some(p.status.as_str())).collect::<Vec<_>>());
    let list_prices = Float64Array::from(points.iter().map(|p| p.list_price).collect::<Vec<_>>());
    let close_prices = Float64Array::from(points.iter().map(|p| p.close_price).collect::<Vec<_>>());
    let captured = StringArray::from(
        points
            .iter()
            .map(|p| Some(p.captured_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(partitions),
            Arc::new(statuses),
            Arc::new(list_prices),
            Arc::new(close_prices),
            Arc::new(captured),
        ],
    )
    .context("building snapshots record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mlsync_core::{ListingStatus, ListingType, Origin};

    #[test]
    fn export_writes_files_and_hashed_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let listing = ListingRecord {
            id: "100".into(),
            partition_key: Some("the-modern".into()),
            address: "222 West Ave".into(),
            unit_label: "1205".into(),
            status: ListingStatus::Closed,
            listing_type: ListingType::Sale,
            list_price: 600_000.0,
            close_price: Some(590_000.0),
            living_area: 1_000.0,
            bedroom_count: 2,
            bathroom_count: 2.0,
            list_date: None,
            close_date: None,
            modified_at: t,
            origin: Origin::AutoSync,
            imported_at: t,
            building_name: None,
            price_per_sqft: Some(590.0),
            public_remarks: None,
            directions: None,
        };
        let point = SnapshotPoint {
            id: "100".into(),
            partition_key: Some("the-modern".into()),
            status: ListingStatus::Closed,
            list_price: 600_000.0,
            close_price: Some(590_000.0),
            captured_at: t,
        };

        let (manifest_path, manifest) =
            export_parquet(dir.path(), &[listing], &[point], t).expect("export");

        assert!(manifest_path.exists());
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            assert_eq!(file.rows, 1);
            assert_eq!(file.sha256.len(), 64);
            assert!(dir.path().join(&file.path).exists());
        }
        let written: ExportManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(written.schema_version, EXPORT_SCHEMA_VERSION);
    }
}
