//! Sync orchestration: building registry, matching, the per-cycle state machine,
//! scheduling and export.

mod export;
mod matcher;

pub use export::{export_parquet, ExportManifest, ExportManifestFile, EXPORT_SCHEMA_VERSION, MANIFEST_FILE};
pub use matcher::{
    normalize_address, normalize_name, similarity, AddressMatcher, MatcherConfig,
    STREET_NUMBER_FALLBACK_CONFIDENCE,
};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mlsync_adapters::{ReplicationClient, ReplicationConfig};
use mlsync_core::{
    is_valid_partition_key, normalize_id, Building, ListingRecord, MatchMethod, SyncMode, SyncState,
    UNMATCHED_PARTITION,
};
use mlsync_storage::{
    EntryStore, FsEntryStore, HttpClientConfig, ListingCache, LockOutcome, RateLimitConfig,
    ReqwestTransport, SnapshotPoint, SnapshotStore, SyncStateStore,
    DEFAULT_PARTITION_CEILING_BYTES,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mlsync-sync";

/// Twice a day, 06:15 and 18:15.
pub const DEFAULT_SYNC_CRON: &str = "0 15 6,18 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct BuildingRegistry {
    pub buildings: Vec<Building>,
}

impl BuildingRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing building registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for building in &self.buildings {
            if !is_valid_partition_key(&building.key) {
                bail!("building key {:?} must be lowercase letters, digits, '-' or '_'", building.key);
            }
            if building.key == UNMATCHED_PARTITION {
                bail!("building key {UNMATCHED_PARTITION:?} is reserved");
            }
            if !seen.insert(building.key.as_str()) {
                bail!("duplicate building key {:?}", building.key);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub originating_system: String,
    pub area_code: Option<String>,
    pub page_size: u32,
    pub max_requests: u32,
    pub http_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub partition_ceiling_bytes: usize,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ReplicationConfig::default();
        Self {
            api_base_url: lookup("MLSYNC_API_BASE_URL").unwrap_or(defaults.base_url),
            api_token: lookup("MLSYNC_API_TOKEN").filter(|v| !v.trim().is_empty()),
            originating_system: lookup("MLSYNC_ORIGINATING_SYSTEM")
                .unwrap_or(defaults.originating_system),
            area_code: match lookup("MLSYNC_AREA_CODE") {
                Some(v) if v.trim().is_empty() => None,
                Some(v) => Some(v.trim().to_string()),
                None => defaults.area_code,
            },
            page_size: lookup("MLSYNC_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            max_requests: lookup("MLSYNC_MAX_REQUESTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.limits.max_requests_per_cycle),
            http_timeout_secs: lookup("MLSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            data_dir: lookup("MLSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            scheduler_enabled: lookup("MLSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("MLSYNC_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            user_agent: lookup("MLSYNC_USER_AGENT").unwrap_or_else(|| "mlsync/0.1".to_string()),
            partition_ceiling_bytes: lookup("MLSYNC_PARTITION_CEILING_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PARTITION_CEILING_BYTES),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn buildings_path(&self) -> PathBuf {
        self.workspace_root.join("buildings.yaml")
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            base_url: self.api_base_url.clone(),
            originating_system: self.originating_system.clone(),
            area_code: self.area_code.clone(),
            page_size: self.page_size,
            limits: RateLimitConfig {
                max_requests_per_cycle: self.max_requests,
                ..RateLimitConfig::default()
            },
            ..ReplicationConfig::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.api_token.clone(),
        }
    }
}

/// Result of anything that has to take the sync lock first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CycleOutcome<T = CycleSummary> {
    Completed(T),
    #[serde(rename_all = "camelCase")]
    AlreadyRunning {
        since: DateTime<Utc>,
        run_id: Option<Uuid>,
    },
}

/// What the assign/upsert/reconcile step did with one batch of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentReport {
    pub matched: usize,
    pub fallback_matches: usize,
    pub unmatched: usize,
    pub added: usize,
    pub updated: usize,
    pub reconciled: usize,
    pub evicted: usize,
    /// Record count of each touched partition after the write.
    pub partitions: BTreeMap<String, usize>,
    pub snapshot_points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub requests: u32,
    pub fetched: usize,
    pub filtered_out: usize,
    pub skipped: usize,
    pub assignment: AssignmentReport,
    pub watermark: String,
    pub counts_by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub records: usize,
    pub assignment: AssignmentReport,
}

pub struct SyncOrchestrator {
    replication: ReplicationClient,
    matcher: AddressMatcher,
    buildings: Vec<Building>,
    cache: ListingCache,
    states: SyncStateStore,
    snapshots: SnapshotStore,
}

impl SyncOrchestrator {
    pub fn new(
        replication: ReplicationClient,
        buildings: Vec<Building>,
        store: Arc<dyn EntryStore>,
    ) -> Self {
        Self {
            replication,
            matcher: AddressMatcher::default(),
            buildings,
            cache: ListingCache::new(store.clone()),
            states: SyncStateStore::new(store.clone()),
            snapshots: SnapshotStore::new(store),
        }
    }

    pub fn with_partition_ceiling(mut self, ceiling_bytes: usize) -> Self {
        self.cache = self.cache.with_ceiling(ceiling_bytes);
        self.snapshots = self.snapshots.with_ceiling(ceiling_bytes);
        self
    }

    pub fn with_matcher(mut self, matcher: AddressMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Production wiring: reqwest transport, filesystem store under `data_dir`,
    /// buildings from `buildings.yaml`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = BuildingRegistry::load(&config.buildings_path()).await?;
        if config.api_token.is_none() {
            warn!("MLSYNC_API_TOKEN is not set; upstream requests will be unauthenticated");
        }
        let transport = ReqwestTransport::new(config.http_client_config())?;
        let replication = ReplicationClient::new(Arc::new(transport), config.replication_config());
        let store: Arc<dyn EntryStore> = Arc::new(FsEntryStore::new(config.data_dir.clone()));
        info!(
            buildings = registry.buildings.len(),
            data_dir = %config.data_dir.display(),
            "sync orchestrator configured"
        );
        Ok(Self::new(replication, registry.buildings, store)
            .with_partition_ceiling(config.partition_ceiling_bytes))
    }

    pub fn buildings(&self) -> &[Building] {
        &self.buildings
    }

    pub async fn run_once(&self) -> Result<CycleOutcome> {
        self.run_once_at(Utc::now()).await
    }

    /// One sync cycle: lock, fetch, assign, upsert, reconcile, commit. A failed
    /// fetch never touches partitions and never moves the watermark.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id);
        async {
            let previous = match self.states.try_begin(now, run_id).await? {
                LockOutcome::Acquired { previous } => previous,
                LockOutcome::AlreadyRunning { since, run_id } => {
                    warn!(%since, running = ?run_id, "sync already in progress; skipping");
                    return Ok(CycleOutcome::AlreadyRunning { since, run_id });
                }
            };

            let mode = match &previous {
                Some(state) if state.has_watermark() => SyncMode::Incremental,
                _ => SyncMode::Initial,
            };
            info!(?mode, "sync cycle started");

            match self.execute_cycle(mode, previous.as_ref(), now, run_id).await {
                Ok(summary) => {
                    info!(
                        fetched = summary.fetched,
                        matched = summary.assignment.matched,
                        unmatched = summary.assignment.unmatched,
                        watermark = %summary.watermark,
                        "sync cycle completed"
                    );
                    Ok(CycleOutcome::Completed(summary))
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "sync cycle failed");
                    if let Err(commit_err) = self
                        .states
                        .commit_failure(previous.as_ref(), &message, now, run_id)
                        .await
                    {
                        error!(error = %format!("{commit_err:#}"), "recording sync failure");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute_cycle(
        &self,
        mode: SyncMode,
        previous: Option<&SyncState>,
        now: DateTime<Utc>,
        run_id: Uuid,
    ) -> Result<CycleSummary> {
        let watermark = previous.map(|s| s.watermark.as_str()).filter(|w| !w.trim().is_empty());
        let fetched = self
            .replication
            .fetch_cycle(mode, watermark)
            .await
            .context("fetching upstream listings")?;

        let mut counts_by_status: BTreeMap<String, usize> = BTreeMap::new();
        for record in &fetched.records {
            *counts_by_status.entry(record.status.as_str().to_string()).or_default() += 1;
        }
        let fetched_count = fetched.records.len();

        let assignment = self.assign_and_store(fetched.records, now).await?;
        let state = self
            .states
            .commit_success(
                previous,
                fetched.new_watermark,
                counts_by_status.clone(),
                mode,
                now,
                run_id,
            )
            .await?;

        Ok(CycleSummary {
            run_id,
            mode,
            started_at: now,
            finished_at: Utc::now(),
            pages: fetched.pages,
            requests: fetched.requests,
            fetched: fetched_count,
            filtered_out: fetched.filtered_out,
            skipped: fetched.skipped,
            assignment,
            watermark: state.watermark,
            counts_by_status,
        })
    }

    pub async fn import_bulk(&self, records: Vec<ListingRecord>) -> Result<CycleOutcome<ImportSummary>> {
        self.import_bulk_at(records, Utc::now()).await
    }

    /// Runs manually imported records through the same assign/upsert/reconcile path
    /// under the sync lock. The sync state is restored afterwards; the watermark is
    /// never touched.
    pub async fn import_bulk_at(
        &self,
        records: Vec<ListingRecord>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome<ImportSummary>> {
        let run_id = Uuid::new_v4();
        let previous = match self.states.try_begin(now, run_id).await? {
            LockOutcome::Acquired { previous } => previous,
            LockOutcome::AlreadyRunning { since, run_id } => {
                warn!(%since, running = ?run_id, "sync in progress; bulk import refused");
                return Ok(CycleOutcome::AlreadyRunning { since, run_id });
            }
        };

        let count = records.len();
        let stored = self.assign_and_store(records, now).await;
        self.states.release(previous.as_ref()).await?;
        let assignment = stored.context("storing bulk import")?;
        info!(%run_id, records = count, unmatched = assignment.unmatched, "bulk import stored");
        Ok(CycleOutcome::Completed(ImportSummary {
            run_id,
            records: count,
            assignment,
        }))
    }

    async fn assign_and_store(
        &self,
        records: Vec<ListingRecord>,
        captured_at: DateTime<Utc>,
    ) -> Result<AssignmentReport> {
        let mut report = AssignmentReport::default();
        let mut groups: BTreeMap<String, Vec<ListingRecord>> = BTreeMap::new();

        for mut record in records {
            record.id = normalize_id(&record.id);
            let result =
                self.matcher
                    .match_address(&record.address, record.building_name.as_deref(), &self.buildings);
            let key = match result.partition_key {
                Some(key) => {
                    report.matched += 1;
                    if result.method == MatchMethod::StreetNumberFallback {
                        report.fallback_matches += 1;
                        debug!(id = %record.id, address = %record.address, partition = %key, "street-number fallback match");
                    }
                    key
                }
                None => {
                    report.unmatched += 1;
                    warn!(id = %record.id, address = %record.address, "no building match; routed to unmatched");
                    UNMATCHED_PARTITION.to_string()
                }
            };
            record.partition_key = Some(key.clone());
            groups.entry(key).or_default().push(record);
        }

        let mut stored = Vec::new();
        for (key, records) in groups {
            let ids = records.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
            stored.extend(records.iter().cloned());
            let summary = self.cache.upsert(&key, records).await?;
            report.reconciled += self.cache.reconcile_across_partitions(&key, &ids).await?;
            report.added += summary.added;
            report.updated += summary.updated;
            report.evicted += summary.evicted;
            report.partitions.insert(key, summary.total);
        }

        report.snapshot_points = self.snapshots.record(&stored, captured_at).await?;
        Ok(report)
    }

    pub async fn get_partition(&self, key: &str) -> Result<Vec<ListingRecord>> {
        self.cache.read_partition(key).await
    }

    pub async fn get_all_listings(&self) -> Result<Vec<ListingRecord>> {
        self.cache.read_all().await
    }

    pub async fn get_sync_status(&self) -> Result<Option<SyncState>> {
        self.states.load().await
    }

    pub async fn get_unmatched_addresses(&self) -> Result<Vec<String>> {
        self.cache.unmatched_addresses().await
    }

    pub async fn partition_keys(&self) -> Result<Vec<String>> {
        self.cache.partition_keys().await
    }

    /// Drops the sync state so the next run bootstraps with an `Initial` cycle.
    pub async fn reset_sync_state(&self) -> Result<bool> {
        let removed = self.states.clear().await?;
        warn!(removed, "sync state reset");
        Ok(removed)
    }

    pub async fn reset_cache(&self) -> Result<usize> {
        self.cache.reset().await
    }

    pub async fn snapshot_points(&self) -> Result<Vec<SnapshotPoint>> {
        let mut points = Vec::new();
        for bucket in self.snapshots.buckets().await? {
            points.extend(self.snapshots.read_bucket(&bucket).await?);
        }
        Ok(points)
    }

    pub async fn export(&self, out_dir: &Path) -> Result<(PathBuf, ExportManifest)> {
        let listings = self.get_all_listings().await?;
        let points = self.snapshot_points().await?;
        export_parquet(out_dir, &listings, &points, Utc::now())
    }
}

pub async fn run_sync_once_from_env() -> Result<CycleOutcome> {
    let config = SyncConfig::from_env();
    let orchestrator = SyncOrchestrator::from_config(&config).await?;
    orchestrator.run_once().await
}

pub async fn maybe_build_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_once().await {
                Ok(CycleOutcome::Completed(summary)) => {
                    info!(run_id = %summary.run_id, fetched = summary.fetched, "scheduled sync finished");
                }
                Ok(CycleOutcome::AlreadyRunning { since, .. }) => {
                    info!(%since, "scheduled sync skipped; previous run still in progress");
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "scheduled sync failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Runs the cron scheduler until ctrl-c.
pub async fn run_scheduler_until_shutdown(
    orchestrator: Arc<SyncOrchestrator>,
    config: &SyncConfig,
) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(orchestrator, config).await? else {
        bail!("scheduler disabled; set MLSYNC_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use mlsync_core::{ListingStatus, ListingType, Origin, SyncStatus};
    use mlsync_storage::{FetchError, JsonTransport, MemoryEntryStore};
    use serde_json::{json, Value as JsonValue};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        pages: Mutex<VecDeque<Result<JsonValue, FetchError>>>,
        requested: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn push(&self, page: Result<JsonValue, FetchError>) {
            self.pages.lock().unwrap().push_back(page);
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JsonTransport for ScriptedTransport {
        async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({ "value": [] })))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn buildings() -> Vec<Building> {
        BuildingRegistry::from_yaml_str(
            r#"
buildings:
  - key: the-modern
    name: The Modern Austin
    address: 222 West Ave
  - key: the-independent
    name: The Independent
    address: 40 N IH 35
"#,
        )
        .unwrap()
        .buildings
    }

    fn harness() -> (Arc<ScriptedTransport>, Arc<MemoryEntryStore>, SyncOrchestrator) {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemoryEntryStore::new());
        let config = ReplicationConfig {
            base_url: "https://upstream.test/v2/Property".into(),
            categories: vec![mlsync_adapters::CategoryQuery {
                property_type: "Residential".into(),
                listing_type: ListingType::Sale,
            }],
            limits: RateLimitConfig {
                max_requests_per_cycle: 20,
                warn_rate_per_sec: 1.5,
                backoff_delay: Duration::ZERO,
                page_delay: Duration::ZERO,
            },
            ..ReplicationConfig::default()
        };
        let replication = ReplicationClient::new(transport.clone(), config);
        let orchestrator = SyncOrchestrator::new(replication, buildings(), store.clone());
        (transport, store, orchestrator)
    }

    fn upstream(id: &str, address: &str, modified: &str) -> JsonValue {
        json!({
            "ListingId": id,
            "StandardStatus": "Active",
            "PropertySubType": "Condominium",
            "MLSAreaMajor": "DT",
            "UnparsedAddress": address,
            "ListPrice": 500000,
            "LivingArea": 1000,
            "ModificationTimestamp": modified
        })
    }

    fn bulk_record(id: &str, address: &str) -> ListingRecord {
        let t = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).single().unwrap();
        ListingRecord {
            id: id.into(),
            partition_key: None,
            address: address.into(),
            unit_label: String::new(),
            status: ListingStatus::Closed,
            listing_type: ListingType::Sale,
            list_price: 480_000.0,
            close_price: Some(470_000.0),
            living_area: 1000.0,
            bedroom_count: 2,
            bathroom_count: 2.0,
            list_date: None,
            close_date: None,
            modified_at: t,
            origin: Origin::BulkImport,
            imported_at: t,
            building_name: None,
            price_per_sqft: None,
            public_remarks: None,
            directions: None,
        }
    }

    #[tokio::test]
    async fn failed_page_keeps_watermark_and_partitions() {
        let (transport, _store, orchestrator) = harness();
        let states = &orchestrator.states;
        let mut seeded = SyncState::idle(t0() - ChronoDuration::days(1));
        seeded.status = SyncStatus::Success;
        seeded.watermark = "2026-02-01T00:00:00.000Z".into();
        states.save(&seeded).await.unwrap();

        transport.push(Ok(json!({
            "value": [upstream("ACT1", "222 West Ave", "2026-02-20T00:00:00Z")],
            "@odata.nextLink": "https://upstream.test/v2/Property?page=2"
        })));
        transport.push(Err(FetchError::HttpStatus {
            status: 503,
            url: "https://upstream.test/v2/Property?page=2".into(),
        }));
        transport.push(Ok(json!({
            "value": [upstream("ACT2", "222 West Ave", "2026-02-21T00:00:00Z")]
        })));

        let err = orchestrator.run_once_at(t0()).await.expect_err("cycle should fail");
        assert!(format!("{err:#}").contains("503"));
        assert_eq!(transport.requested().len(), 2);

        let state = orchestrator.get_sync_status().await.unwrap().expect("state");
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.watermark, "2026-02-01T00:00:00.000Z");
        assert!(state.error_message.is_some());
        assert!(orchestrator.partition_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_run_failure_leaves_next_run_initial() {
        let (transport, _store, orchestrator) = harness();
        transport.push(Err(FetchError::HttpStatus {
            status: 500,
            url: "https://upstream.test/v2/Property".into(),
        }));
        assert!(orchestrator.run_once_at(t0()).await.is_err());
        assert!(orchestrator.get_sync_status().await.unwrap().is_none());

        let outcome = orchestrator.run_once_at(t0()).await.expect("retry");
        let CycleOutcome::Completed(summary) = outcome else {
            panic!("retry should run");
        };
        assert_eq!(summary.mode, SyncMode::Initial);
    }

    #[tokio::test]
    async fn fresh_lock_refuses_and_stale_lock_recovers() {
        let (_transport, _store, orchestrator) = harness();
        let mut running = SyncState::idle(t0());
        running.status = SyncStatus::InProgress;
        orchestrator.states.save(&running).await.unwrap();

        let refused = orchestrator
            .run_once_at(t0() + ChronoDuration::minutes(5))
            .await
            .expect("refusal is not an error");
        assert!(matches!(refused, CycleOutcome::AlreadyRunning { since, .. } if since == t0()));

        let recovered = orchestrator
            .run_once_at(t0() + ChronoDuration::minutes(11))
            .await
            .expect("stale lock recovers");
        assert!(matches!(recovered, CycleOutcome::Completed(_)));
        let state = orchestrator.get_sync_status().await.unwrap().expect("state");
        assert_eq!(state.status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn initial_then_incremental_advances_watermark() {
        let (transport, _store, orchestrator) = harness();
        transport.push(Ok(json!({
            "value": [
                upstream("ACT1", "222 West Ave", "2026-02-20T00:00:00Z"),
                upstream("ACT2", "40 N IH 35", "2026-02-22T08:30:00Z")
            ]
        })));

        let CycleOutcome::Completed(first) = orchestrator.run_once_at(t0()).await.unwrap() else {
            panic!("first cycle should run");
        };
        assert_eq!(first.mode, SyncMode::Initial);
        assert_eq!(first.watermark, "2026-02-22T08:30:00.000Z");
        assert_eq!(first.assignment.matched, 2);
        assert_eq!(first.counts_by_status.get("Active"), Some(&2));

        let later = t0() + ChronoDuration::hours(12);
        let CycleOutcome::Completed(second) = orchestrator.run_once_at(later).await.unwrap() else {
            panic!("second cycle should run");
        };
        assert_eq!(second.mode, SyncMode::Incremental);
        assert_eq!(second.fetched, 0);
        assert_eq!(second.watermark, "2026-02-22T08:30:00.000Z");

        let requested = transport.requested();
        let filter = query_filter(&requested[1]);
        assert!(filter.contains("ModificationTimestamp gt 2026-02-22T08:30:00.000Z"));
    }

    fn query_filter(url: &str) -> String {
        reqwest::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "$filter")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn synced_record_reconciles_bulk_import_out_of_unmatched() {
        let (transport, _store, orchestrator) = harness();

        let imported = orchestrator
            .import_bulk_at(vec![bulk_record("ACT100", "999 Nowhere Rd")], t0())
            .await
            .unwrap();
        let CycleOutcome::Completed(import) = imported else {
            panic!("import should run");
        };
        assert_eq!(import.assignment.unmatched, 1);
        assert_eq!(
            orchestrator.get_unmatched_addresses().await.unwrap(),
            vec!["999 Nowhere Rd".to_string()]
        );
        assert!(orchestrator.get_sync_status().await.unwrap().is_none());

        transport.push(Ok(json!({
            "value": [upstream("100", "222 WEST AVE #1205", "2026-02-20T00:00:00Z")]
        })));
        let CycleOutcome::Completed(cycle) = orchestrator
            .run_once_at(t0() + ChronoDuration::minutes(1))
            .await
            .unwrap()
        else {
            panic!("cycle should run");
        };
        assert_eq!(cycle.assignment.reconciled, 1);

        assert!(orchestrator.get_unmatched_addresses().await.unwrap().is_empty());
        let modern = orchestrator.get_partition("the-modern").await.unwrap();
        assert_eq!(modern.len(), 1);
        assert_eq!(modern[0].id, "100");

        let all = orchestrator.get_all_listings().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].origin, Origin::AutoSync);
        assert_eq!(all[0].partition_key.as_deref(), Some("the-modern"));
    }

    #[tokio::test]
    async fn import_is_refused_while_a_cycle_holds_the_lock() {
        let (_transport, _store, orchestrator) = harness();
        let mut running = SyncState::idle(t0());
        running.status = SyncStatus::InProgress;
        orchestrator.states.save(&running).await.unwrap();

        let outcome = orchestrator
            .import_bulk_at(vec![bulk_record("1", "222 West Ave")], t0() + ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::AlreadyRunning { .. }));
        assert!(orchestrator.partition_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_clears_state_and_cache() {
        let (transport, _store, orchestrator) = harness();
        transport.push(Ok(json!({
            "value": [upstream("ACT1", "222 West Ave", "2026-02-20T00:00:00Z")]
        })));
        orchestrator.run_once_at(t0()).await.unwrap();

        assert!(orchestrator.reset_sync_state().await.unwrap());
        assert_eq!(orchestrator.reset_cache().await.unwrap(), 1);
        assert!(orchestrator.get_sync_status().await.unwrap().is_none());
        assert!(orchestrator.get_all_listings().await.unwrap().is_empty());
        assert_eq!(orchestrator.snapshot_points().await.unwrap().len(), 1);
    }

    #[test]
    fn registry_rejects_bad_and_reserved_keys() {
        assert!(BuildingRegistry::from_yaml_str("buildings:\n  - {key: The Modern, name: x, address: y}\n").is_err());
        assert!(BuildingRegistry::from_yaml_str("buildings:\n  - {key: unmatched, name: x, address: y}\n").is_err());
        assert!(BuildingRegistry::from_yaml_str(
            "buildings:\n  - {key: a, name: x, address: y}\n  - {key: a, name: z, address: w}\n"
        )
        .is_err());
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let vars = HashMap::from([
            ("MLSYNC_PAGE_SIZE", "250"),
            ("MLSYNC_AREA_CODE", ""),
            ("MLSYNC_SCHEDULER_ENABLED", "true"),
            ("MLSYNC_API_TOKEN", "secret"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.page_size, 250);
        assert_eq!(config.area_code, None);
        assert!(config.scheduler_enabled);
        assert_eq!(config.max_requests, 500);
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(config.http_client_config().bearer_token.as_deref(), Some("secret"));

        let replication = config.replication_config();
        assert_eq!(replication.page_size, 250);
        assert_eq!(replication.categories.len(), 2);
    }
}
