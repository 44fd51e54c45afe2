//! Partitioned listing cache: one entry per building key plus `unmatched`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mlsync_core::{normalize_id, ListingRecord, UNMATCHED_PARTITION};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::EntryStore;

pub const PARTITIONS_NAMESPACE: &str = "partitions";

/// Per-partition storage ceiling, measured on the serialized entry.
pub const DEFAULT_PARTITION_CEILING_BYTES: usize = 1024 * 1024;

/// Share of the oldest records evicted when a trimmed partition is still over the ceiling.
const EVICTION_FRACTION: f64 = 0.30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionEntry {
    key: String,
    updated_at: DateTime<Utc>,
    records: Vec<ListingRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub added: usize,
    pub updated: usize,
    pub total: usize,
    pub evicted: usize,
}

/// Drops the large free-text fields before persistence.
pub fn trim_record(mut record: ListingRecord) -> ListingRecord {
    record.public_remarks = None;
    record.directions = None;
    record
}

/// Authority order for the same id seen in two partitions: `AutoSync` beats
/// `BulkImport`; within one origin the later `imported_at` wins.
pub fn supersedes(candidate: &ListingRecord, current: &ListingRecord) -> bool {
    let (cand_rank, cur_rank) = (
        candidate.origin.authority_rank(),
        current.origin.authority_rank(),
    );
    cand_rank > cur_rank || (cand_rank == cur_rank && candidate.imported_at > current.imported_at)
}

pub struct ListingCache {
    store: Arc<dyn EntryStore>,
    ceiling_bytes: usize,
}

impl ListingCache {
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

    pub async fn partition_keys(&self) -> anyhow::Result<Vec<String>> {
        self.store.list(PARTITIONS_NAMESPACE).await
    }

    pub async fn read_partition(&self, key: &str) -> anyhow::Result<Vec<ListingRecord>> {
        let Some(bytes) = self.store.get(PARTITIONS_NAMESPACE, key).await? else {
            return Ok(Vec::new());
        };
        let entry: PartitionEntry = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing partition {key}"))?;
        Ok(entry.records)
    }

    /// Merges `records` into a partition keyed by normalized id. Incoming records
    /// always replace existing ones with the same id.
    pub async fn upsert(
        &self,
        partition_key: &str,
        records: Vec<ListingRecord>,
    ) -> anyhow::Result<UpsertSummary> {
        let existing = self.read_partition(partition_key).await?;
        let mut by_id: BTreeMap<String, ListingRecord> = existing
            .into_iter()
            .map(|record| (normalize_id(&record.id), record))
            .collect();

        let mut summary = UpsertSummary::default();
        for mut record in records {
            record.id = normalize_id(&record.id);
            record.partition_key = Some(partition_key.to_string());
            if by_id.insert(record.id.clone(), trim_record(record)).is_some() {
                summary.updated += 1;
            } else {
                summary.added += 1;
            }
        }

        let records = by_id.into_values().collect::<Vec<_>>();
        let (total, evicted) = self.write_partition(partition_key, records).await?;
        summary.total = total;
        summary.evicted = evicted;
        debug!(
            partition = partition_key,
            added = summary.added,
            updated = summary.updated,
            total = summary.total,
            "partition upserted"
        );
        Ok(summary)
    }

    /// Removes `ids` from every partition other than `target_key`.
    pub async fn reconcile_across_partitions(
        &self,
        target_key: &str,
        ids: &[String],
    ) -> anyhow::Result<usize> {
        let wanted = ids.iter().map(|id| normalize_id(id)).collect::<HashSet<_>>();
        if wanted.is_empty() {
            return Ok(0);
        }

        let mut removed = 0usize;
        for key in self.partition_keys().await? {
            if key == target_key {
                continue;
            }
            let mut records = self.read_partition(&key).await?;
            let before = records.len();
            records.retain(|record| !wanted.contains(&normalize_id(&record.id)));
            let dropped = before - records.len();
            if dropped > 0 {
                info!(from = %key, to = target_key, moved = dropped, "reconciled records across partitions");
                self.write_partition(&key, records).await?;
                removed += dropped;
            }
        }
        Ok(removed)
    }

    /// Every record across all partitions, one per normalized id.
    pub async fn read_all(&self) -> anyhow::Result<Vec<ListingRecord>> {
        let mut by_id: BTreeMap<String, ListingRecord> = BTreeMap::new();
        for key in self.partition_keys().await? {
            for record in self.read_partition(&key).await? {
                let id = normalize_id(&record.id);
                let replace = by_id
                    .get(&id)
                    .map_or(true, |current| supersedes(&record, current));
                if replace {
                    by_id.insert(id, record);
                }
            }
        }
        Ok(by_id.into_values().collect())
    }

    pub async fn unmatched_addresses(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .read_partition(UNMATCHED_PARTITION)
            .await?
            .into_iter()
            .map(|record| record.address.trim().to_string())
            .filter(|address| !address.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    /// Deletes every partition. Returns the number of partitions removed.
    pub async fn reset(&self) -> anyhow::Result<usize> {
        let mut removed = 0usize;
        for key in self.partition_keys().await? {
            if self.store.delete(PARTITIONS_NAMESPACE, &key).await? {
                removed += 1;
            }
        }
        warn!(partitions = removed, "listing cache reset");
        Ok(removed)
    }

    async fn write_partition(
        &self,
        key: &str,
        mut records: Vec<ListingRecord>,
    ) -> anyhow::Result<(usize, usize)> {
        let mut bytes = encode_partition(key, &records)?;
        let mut evicted = 0usize;
        if bytes.len() > self.ceiling_bytes && !records.is_empty() {
            records.sort_by(|a, b| a.modified_at.cmp(&b.modified_at));
            evicted = ((records.len() as f64) * EVICTION_FRACTION).ceil() as usize;
            records.drain(..evicted.min(records.len()));
            let before = bytes.len();
            bytes = encode_partition(key, &records)?;
            warn!(
                partition = key,
                ceiling = self.ceiling_bytes,
                before_bytes = before,
                after_bytes = bytes.len(),
                evicted,
                "partition over size ceiling; evicted oldest records"
            );
        }
        self.store
            .put(PARTITIONS_NAMESPACE, key, &bytes)
            .await
            .with_context(|| format!("writing partition {key}"))?;
        Ok((records.len(), evicted))
    }
}

fn encode_partition(key: &str, records: &[ListingRecord]) -> anyhow::Result<Vec<u8>> {
    let entry = PartitionEntry {
        key: key.to_string(),
        updated_at: Utc::now(),
        records: records.to_vec(),
    };
    serde_json::to_vec(&entry).with_context(|| format!("serializing partition {key}"))
}
