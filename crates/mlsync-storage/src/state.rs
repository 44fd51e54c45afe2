//! Singleton sync-state entry and the advisory `InProgress` lock.
//!
//! The lock is read-then-write, not compare-and-swap: two invocations racing inside
//! the same instant can both acquire it. The staleness window recovers crashed runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mlsync_core::{SyncMode, SyncState, SyncStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::EntryStore;

pub const STATE_NAMESPACE: &str = "state";
pub const SYNC_STATE_KEY: &str = "sync";

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// The lock is held by this run; `previous` is the state found before acquiring.
    Acquired { previous: Option<SyncState> },
    AlreadyRunning {
        since: DateTime<Utc>,
        run_id: Option<Uuid>,
    },
}

pub struct SyncStateStore {
    store: Arc<dyn EntryStore>,
}

impl SyncStateStore {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> anyhow::Result<Option<SyncState>> {
        let Some(bytes) = self.store.get(STATE_NAMESPACE, SYNC_STATE_KEY).await? else {
            return Ok(None);
        };
        let state = serde_json::from_slice(&bytes).context("parsing sync state")?;
        Ok(Some(state))
    }

    pub async fn save(&self, state: &SyncState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(state).context("serializing sync state")?;
        self.store
            .put(STATE_NAMESPACE, SYNC_STATE_KEY, &bytes)
            .await
            .context("writing sync state")
    }

    /// Removes the entry so the next run starts as `Initial`.
    pub async fn clear(&self) -> anyhow::Result<bool> {
        self.store.delete(STATE_NAMESPACE, SYNC_STATE_KEY).await
    }

    /// Refuses while a fresh `InProgress` run exists; otherwise writes `InProgress`.
    pub async fn try_begin(&self, now: DateTime<Utc>, run_id: Uuid) -> anyhow::Result<LockOutcome> {
        let previous = self.load().await?;
        if let Some(state) = &previous {
            if state.is_locked_at(now) {
                return Ok(LockOutcome::AlreadyRunning {
                    since: state.last_run_at,
                    run_id: state.run_id,
                });
            }
            if state.status == SyncStatus::InProgress {
                warn!(
                    abandoned_run = ?state.run_id,
                    since = %state.last_run_at,
                    "superseding abandoned in-progress sync"
                );
            }
        }

        let mut in_progress = previous.clone().unwrap_or_else(|| SyncState::idle(now));
        in_progress.status = SyncStatus::InProgress;
        in_progress.last_run_at = now;
        in_progress.error_message = None;
        in_progress.run_id = Some(run_id);
        self.save(&in_progress).await?;
        Ok(LockOutcome::Acquired { previous })
    }

    /// Marks the run successful. The watermark only moves forward: a missing or older
    /// `new_watermark` keeps the previous one.
    pub async fn commit_success(
        &self,
        previous: Option<&SyncState>,
        new_watermark: Option<String>,
        counts_by_status: BTreeMap<String, usize>,
        mode: SyncMode,
        started_at: DateTime<Utc>,
        run_id: Uuid,
    ) -> anyhow::Result<SyncState> {
        let previous_watermark = previous.map(|s| s.watermark.clone()).unwrap_or_default();
        let watermark = match new_watermark {
            Some(new) if !is_before(&new, &previous_watermark) => new,
            Some(new) => {
                warn!(%run_id, new = %new, kept = %previous_watermark, "ignoring watermark older than the stored one");
                previous_watermark
            }
            None => previous_watermark,
        };
        let state = SyncState {
            watermark,
            status: SyncStatus::Success,
            last_run_at: started_at,
            counts_by_status,
            error_message: None,
            last_mode: Some(mode),
            run_id: Some(run_id),
        };
        self.save(&state).await?;
        info!(%run_id, watermark = %state.watermark, "sync state committed");
        Ok(state)
    }

    /// Hands the lock back without recording a sync run, restoring what `try_begin`
    /// found. A stale `InProgress` entry comes back as `Idle`.
    pub async fn release(&self, previous: Option<&SyncState>) -> anyhow::Result<()> {
        match previous {
            Some(previous) => {
                let mut state = previous.clone();
                if state.status == SyncStatus::InProgress {
                    state.status = SyncStatus::Idle;
                }
                self.save(&state).await
            }
            None => self.clear().await.map(|_| ()),
        }
    }

    /// Records a failed run with the previous watermark untouched. With no prior
    /// state at all the entry is removed again.
    pub async fn commit_failure(
        &self,
        previous: Option<&SyncState>,
        message: &str,
        started_at: DateTime<Utc>,
        run_id: Uuid,
    ) -> anyhow::Result<Option<SyncState>> {
        let Some(previous) = previous else {
            self.clear().await?;
            warn!(%run_id, "first sync failed; state left empty so the next run is initial");
            return Ok(None);
        };
        let mut state = previous.clone();
        state.status = SyncStatus::Error;
        state.error_message = Some(message.to_string());
        state.last_run_at = started_at;
        state.run_id = Some(run_id);
        self.save(&state).await?;
        Ok(Some(state))
    }
}

fn is_before(candidate: &str, reference: &str) -> bool {
    let parse = |raw: &str| DateTime::parse_from_rfc3339(raw.trim()).ok();
    match (parse(candidate), parse(reference)) {
        (Some(candidate), Some(reference)) => candidate < reference,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEntryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn stale_lock_is_superseded_but_fresh_lock_refuses() {
        let states = SyncStateStore::new(Arc::new(MemoryEntryStore::new()));
        let first = states.try_begin(t0(), Uuid::new_v4()).await.expect("begin");
        assert_eq!(first, LockOutcome::Acquired { previous: None });

        let refused = states
            .try_begin(t0() + Duration::minutes(5), Uuid::new_v4())
            .await
            .expect("second");
        assert!(matches!(refused, LockOutcome::AlreadyRunning { since, .. } if since == t0()));

        let recovered = states
            .try_begin(t0() + Duration::minutes(11), Uuid::new_v4())
            .await
            .expect("third");
        assert!(matches!(recovered, LockOutcome::Acquired { previous: Some(_) }));
    }

    #[tokio::test]
    async fn failure_keeps_previous_watermark() {
        let states = SyncStateStore::new(Arc::new(MemoryEntryStore::new()));
        let mut previous = SyncState::idle(t0());
        previous.status = SyncStatus::Success;
        previous.watermark = "2026-02-28T10:00:00Z".into();
        states.save(&previous).await.expect("seed");

        let failed = states
            .commit_failure(Some(&previous), "http status 502", t0(), Uuid::new_v4())
            .await
            .expect("fail")
            .expect("state");
        assert_eq!(failed.status, SyncStatus::Error);
        assert_eq!(failed.watermark, "2026-02-28T10:00:00Z");
        assert_eq!(states.load().await.expect("load"), Some(failed));
    }

    #[tokio::test]
    async fn first_run_failure_leaves_no_state() {
        let states = SyncStateStore::new(Arc::new(MemoryEntryStore::new()));
        states.try_begin(t0(), Uuid::new_v4()).await.expect("begin");
        states
            .commit_failure(None, "boom", t0(), Uuid::new_v4())
            .await
            .expect("fail");
        assert!(states.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn release_restores_previous_state() {
        let states = SyncStateStore::new(Arc::new(MemoryEntryStore::new()));
        let mut previous = SyncState::idle(t0());
        previous.status = SyncStatus::Success;
        previous.watermark = "2026-02-28T10:00:00Z".into();
        states.save(&previous).await.expect("seed");

        let outcome = states
            .try_begin(t0() + Duration::minutes(1), Uuid::new_v4())
            .await
            .expect("begin");
        let LockOutcome::Acquired { previous: found } = outcome else {
            panic!("lock should be free");
        };
        states.release(found.as_ref()).await.expect("release");
        assert_eq!(states.load().await.expect("load"), Some(previous));

        states.clear().await.expect("clear");
        states.try_begin(t0(), Uuid::new_v4()).await.expect("begin");
        states.release(None).await.expect("release");
        assert!(states.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn success_without_new_watermark_keeps_old_one() {
        let states = SyncStateStore::new(Arc::new(MemoryEntryStore::new()));
        let mut previous = SyncState::idle(t0());
        previous.watermark = "2026-02-28T10:00:00Z".into();
        let committed = states
            .commit_success(
                Some(&previous),
                None,
                BTreeMap::new(),
                SyncMode::Incremental,
                t0(),
                Uuid::new_v4(),
            )
            .await
            .expect("commit");
        assert_eq!(committed.status, SyncStatus::Success);
        assert_eq!(committed.watermark, "2026-02-28T10:00:00Z");
    }

    #[tokio::test]
    async fn older_watermark_does_not_roll_back() {
        let states = SyncStateStore::new(Arc::new(MemoryEntryStore::new()));
        let mut previous = SyncState::idle(t0());
        previous.watermark = "2026-02-01T00:00:00Z".into();
        let committed = states
            .commit_success(
                Some(&previous),
                Some("2026-01-01T00:00:00.000Z".into()),
                BTreeMap::new(),
                SyncMode::Incremental,
                t0(),
                Uuid::new_v4(),
            )
            .await
            .expect("commit");
        assert_eq!(committed.watermark, "2026-02-01T00:00:00Z");

        let advanced = states
            .commit_success(
                Some(&committed),
                Some("2026-02-02T00:00:00.000Z".into()),
                BTreeMap::new(),
                SyncMode::Incremental,
                t0(),
                Uuid::new_v4(),
            )
            .await
            .expect("commit");
        assert_eq!(advanced.watermark, "2026-02-02T00:00:00.000Z");
    }
}
