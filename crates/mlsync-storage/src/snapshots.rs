//! Append-only monthly buckets of point-in-time status/price observations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mlsync_core::{ListingRecord, ListingStatus};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::DEFAULT_PARTITION_CEILING_BYTES;
use crate::EntryStore;

pub const SNAPSHOTS_NAMESPACE: &str = "snapshots";

const EVICTION_FRACTION: f64 = 0.30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPoint {
    pub id: String,
    pub partition_key: Option<String>,
    pub status: ListingStatus,
    pub list_price: f64,
    pub close_price: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotPoint {
    fn from_record(record: &ListingRecord, captured_at: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            partition_key: record.partition_key.clone(),
            status: record.status,
            list_price: record.list_price,
            close_price: record.close_price,
            captured_at,
        }
    }

    fn same_observation(&self, other: &SnapshotPoint) -> bool {
        self.status == other.status
            && self.list_price == other.list_price
            && self.close_price == other.close_price
    }
}

pub struct SnapshotStore {
    store: Arc<dyn EntryStore>,
    ceiling_bytes: usize,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self {
            store,
            ceiling_bytes: DEFAULT_PARTITION_CEILING_BYTES,
        }
    }

    pub fn with_ceiling(mut self, ceiling_bytes: usize) -> Self {
        self.ceiling_bytes = ceiling_bytes.max(1);
        self
    }

    pub fn bucket_key(at: DateTime<Utc>) -> String {
        at.format("%Y-%m").to_string()
    }

    pub async fn buckets(&self) -> anyhow::Result<Vec<String>> {
        self.store.list(SNAPSHOTS_NAMESPACE).await
    }

    pub async fn read_bucket(&self, bucket: &str) -> anyhow::Result<Vec<SnapshotPoint>> {
        let Some(bytes) = self.store.get(SNAPSHOTS_NAMESPACE, bucket).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).with_context(|| format!("parsing snapshot bucket {bucket}"))
    }

    /// Appends a point for every record whose status or price differs from its last
    /// point in the current month. Returns how many points were appended.
    pub async fn record(
        &self,
        records: &[ListingRecord],
        captured_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let bucket = Self::bucket_key(captured_at);
        let mut points = self.read_bucket(&bucket).await?;

        let mut last_by_id: HashMap<String, SnapshotPoint> = HashMap::new();
        for point in &points {
            last_by_id.insert(point.id.clone(), point.clone());
        }

        let mut appended = 0usize;
        for record in records {
            let point = SnapshotPoint::from_record(record, captured_at);
            let changed = last_by_id
                .get(&point.id)
                .map_or(true, |last| !last.same_observation(&point));
            if changed {
                last_by_id.insert(point.id.clone(), point.clone());
                points.push(point);
                appended += 1;
            }
        }
        if appended == 0 {
            return Ok(0);
        }

        let mut bytes = serde_json::to_vec(&points).context("serializing snapshot bucket")?;
        if bytes.len() > self.ceiling_bytes {
            let evict = ((points.len() as f64) * EVICTION_FRACTION).ceil() as usize;
            points.drain(..evict.min(points.len()));
            bytes = serde_json::to_vec(&points).context("serializing snapshot bucket")?;
            warn!(
                bucket = %bucket,
                evicted = evict,
                bytes = bytes.len(),
                "snapshot bucket over size ceiling; dropped oldest points"
            );
        }
        self.store
            .put(SNAPSHOTS_NAMESPACE, &bucket, &bytes)
            .await
            .with_context(|| format!("writing snapshot bucket {bucket}"))?;
        Ok(appended)
    }
}
