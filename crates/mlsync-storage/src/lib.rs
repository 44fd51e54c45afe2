//! Durable entry storage, the partitioned listing cache, sync bookkeeping and the
//! rate-limited upstream HTTP client.

mod cache;
mod snapshots;
mod state;

pub use cache::{
    supersedes, trim_record, ListingCache, UpsertSummary, DEFAULT_PARTITION_CEILING_BYTES,
    PARTITIONS_NAMESPACE,
};
pub use snapshots::{SnapshotPoint, SnapshotStore, SNAPSHOTS_NAMESPACE};
pub use state::{LockOutcome, SyncStateStore, STATE_NAMESPACE, SYNC_STATE_KEY};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mlsync-storage";

/// Namespaced key/value persistence. Each entry is one opaque JSON document.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
    /// Returns whether an entry was actually removed.
    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<bool>;
    /// Keys present in a namespace, sorted.
    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>>;
}

fn validate_segment(kind: &str, segment: &str) -> anyhow::Result<()> {
    if segment.is_empty()
        || segment.starts_with('.')
        || segment.contains(['/', '\\'])
        || segment.contains("..")
    {
        bail!("invalid {kind} {segment:?}");
    }
    Ok(())
}

/// Filesystem-backed store: `<root>/<namespace>/<key>.json`, written atomically
/// through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FsEntryStore {
    root: PathBuf,
}

impl FsEntryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, namespace: &str, key: &str) -> anyhow::Result<PathBuf> {
        validate_segment("namespace", namespace)?;
        validate_segment("key", key)?;
        Ok(self.root.join(namespace).join(format!("{key}.json")))
    }
}

#[async_trait]
impl EntryStore for FsEntryStore {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.entry_path(namespace, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading entry {}", path.display())),
        }
    }

    async fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let absolute_path = self.entry_path(namespace, key)?;
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating entry directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp entry file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp entry file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp entry file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp entry {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<bool> {
        let path = self.entry_path(namespace, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing entry {}", path.display())),
        }
    }

    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        validate_segment("namespace", namespace)?;
        let dir = self.root.join(namespace);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process store used by tests and one-shot tooling.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        validate_segment("namespace", namespace)?;
        validate_segment("key", key)?;
        let mut entries = self.entries.lock().await;
        entries.insert((namespace.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("safety cap exceeded: more than {cap} requests in one cycle (next url {url})")]
    SafetyCapExceeded { cap: u32, url: String },
}

impl FetchError {
    pub fn is_safety_cap(&self) -> bool {
        matches!(self, Self::SafetyCapExceeded { .. })
    }
}

/// One GET returning a JSON document. Any non-2xx response is an error.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
        }
    }
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            bearer_token: config.bearer_token,
        })
    }
}

#[async_trait]
impl JsonTransport for ReqwestTransport {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let mut request = self.client.get(url).header(ACCEPT, "application/json");
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let body = resp.bytes().await?;
            serde_json::from_slice::<JsonValue>(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Hard cap; the request that would exceed it fails instead of being sent.
    pub max_requests_per_cycle: u32,
    /// Observed requests/second above which `backoff_delay` is added before a request.
    pub warn_rate_per_sec: f64,
    pub backoff_delay: Duration,
    /// Baseline pause the caller takes between pages.
    pub page_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_cycle: 500,
            warn_rate_per_sec: 1.5,
            backoff_delay: Duration::from_secs(2),
            page_delay: Duration::from_secs(2),
        }
    }
}

/// Per-cycle request budget and pacing around a [`JsonTransport`].
///
/// Counters live on the instance, so every cycle builds a fresh client.
pub struct RateLimitedHttpClient {
    transport: Arc<dyn JsonTransport>,
    limits: RateLimitConfig,
    request_count: u32,
    cycle_start: Instant,
}

impl RateLimitedHttpClient {
    pub fn new(transport: Arc<dyn JsonTransport>, limits: RateLimitConfig) -> Self {
        Self {
            transport,
            limits,
            request_count: 0,
            cycle_start: Instant::now(),
        }
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Requests per second since the cycle started. Elapsed time is floored at one
    /// second so the first requests of a cycle do not read as a burst.
    pub fn observed_rate(&self) -> f64 {
        let elapsed = self.cycle_start.elapsed().as_secs_f64().max(1.0);
        f64::from(self.request_count) / elapsed
    }

    pub async fn request(&mut self, url: &str) -> Result<JsonValue, FetchError> {
        self.request_count += 1;
        if self.request_count > self.limits.max_requests_per_cycle {
            warn!(
                request_count = self.request_count,
                cap = self.limits.max_requests_per_cycle,
                url,
                "request safety cap exceeded; aborting cycle"
            );
            return Err(FetchError::SafetyCapExceeded {
                cap: self.limits.max_requests_per_cycle,
                url: url.to_string(),
            });
        }

        let observed_rate = self.observed_rate();
        info!(
            seq = self.request_count,
            observed_rate,
            "upstream request"
        );
        if observed_rate > self.limits.warn_rate_per_sec {
            warn!(
                observed_rate,
                threshold = self.limits.warn_rate_per_sec,
                "request rate above threshold; backing off"
            );
            tokio::time::sleep(self.limits.backoff_delay).await;
        }

        self.transport.get_json(url).await
    }

    pub async fn pause_between_pages(&self) {
        if !self.limits.page_delay.is_zero() {
            debug!(delay_ms = self.limits.page_delay.as_millis() as u64, "inter-page delay");
            tokio::time::sleep(self.limits.page_delay).await;
        }
    }
}
