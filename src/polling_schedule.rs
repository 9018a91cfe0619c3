//! Adaptive polling schedule.
//!
//! Each tracked registration owns one entry in a due-time ordered set plus a
//! metadata record. A cycle claims due entries (removing them), polls the
//! upstream, then writes the outcome back as a fresh due time and new state in
//! one atomic step. Both structures carry a sliding expiry so a fleet that is no
//! longer synced ages out instead of accumulating stale entries.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ScheduleConfig;
use crate::live_positions::normalize_registration;

/// Last known state of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Unknown,
    Airborne,
    Ground,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::Unknown => "unknown",
            EntityState::Airborne => "airborne",
            EntityState::Ground => "ground",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity metadata stored next to the schedule entry. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub state: EntityState,
    /// Only ever set by a found outcome
    pub last_seen_timestamp: Option<i64>,
    pub updated_at_timestamp: i64,
}

impl EntityMeta {
    pub fn unknown(now: i64) -> Self {
        Self {
            state: EntityState::Unknown,
            last_seen_timestamp: None,
            updated_at_timestamp: now,
        }
    }

    /// Metadata after a poll outcome, carrying `last_seen_timestamp` over on a miss
    pub fn after_outcome(previous: Option<&EntityMeta>, found: bool, now: i64) -> Self {
        if found {
            Self {
                state: EntityState::Airborne,
                last_seen_timestamp: Some(now),
                updated_at_timestamp: now,
            }
        } else {
            Self {
                state: EntityState::Ground,
                last_seen_timestamp: previous.and_then(|meta| meta.last_seen_timestamp),
                updated_at_timestamp: now,
            }
        }
    }
}

/// Storage primitives the schedule is built on. Implementations must make
/// `claim_due` and `commit_outcome` atomic with respect to concurrent callers.
#[async_trait]
pub trait ScheduleBackend: Send + Sync {
    /// Insert ids that have no schedule entry yet with the given due time and
    /// unknown metadata. Returns how many were inserted.
    async fn add_if_absent(&self, ids: &[String], due: i64, now: i64) -> Result<usize>;

    /// Remove and return up to `limit` ids with due time <= `now`, oldest first
    async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<String>>;

    /// Insert or overwrite one schedule entry
    async fn set_due(&self, id: &str, due: i64) -> Result<()>;

    async fn get_meta(&self, id: &str) -> Result<Option<EntityMeta>>;

    async fn set_meta(&self, id: &str, meta: &EntityMeta) -> Result<()>;

    /// Write the schedule entry and metadata together and refresh both expiries
    async fn commit_outcome(&self, id: &str, due: i64, meta: &EntityMeta, ttl: Duration)
    -> Result<()>;

    async fn refresh_expiry(&self, ttl: Duration) -> Result<()>;

    async fn due_time(&self, id: &str) -> Result<Option<i64>>;

    async fn scheduled_count(&self) -> Result<usize>;

    /// Entry with the lowest due time
    async fn next_due(&self) -> Result<Option<(String, i64)>>;
}

/// Polling schedule operations on top of a `ScheduleBackend`
#[derive(Clone)]
pub struct PollingScheduleStore {
    backend: Arc<dyn ScheduleBackend>,
    config: ScheduleConfig,
}

impl PollingScheduleStore {
    pub fn new(backend: Arc<dyn ScheduleBackend>, config: ScheduleConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Admit ids that are not scheduled yet, due immediately. Already scheduled ids
    /// keep their due time. Ids are trimmed and upper-cased; blank ids are ignored.
    pub async fn bootstrap(&self, ids: &[String]) -> Result<usize> {
        self.bootstrap_at(ids, Utc::now()).await
    }

    pub async fn bootstrap_at(&self, ids: &[String], now: DateTime<Utc>) -> Result<usize> {
        let mut unique: Vec<String> = ids
            .iter()
            .filter_map(|id| normalize_registration(id))
            .collect();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Ok(0);
        }

        let now = now.timestamp();
        let added = self.backend.add_if_absent(&unique, now, now).await?;
        if added > 0 {
            info!(added, total = unique.len(), "Admitted entities into polling schedule");
            self.backend.refresh_expiry(self.config.ttl()).await?;
        }
        metrics::counter!("poller.fleet.admitted").increment(added as u64);
        Ok(added)
    }

    /// Atomically claim up to `limit` due ids, oldest due first. Errors propagate
    /// so a store outage skips the cycle instead of producing a partial claim.
    pub async fn claim_due(&self, limit: usize) -> Result<Vec<String>> {
        self.claim_due_at(limit, Utc::now()).await
    }

    pub async fn claim_due_at(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self.backend.claim_due(now.timestamp(), limit).await?;
        debug!(claimed = claimed.len(), limit, "Claimed due entities");
        Ok(claimed)
    }

    /// Next due time for a poll outcome
    pub fn next_due_time(&self, found: bool, now: DateTime<Utc>) -> i64 {
        let interval = if found {
            self.config.interval_found()
        } else {
            self.config.interval_missed()
        };
        now.timestamp() + interval.as_secs() as i64
    }

    /// Re-arm an entity after a poll. Pair with `update_meta`, or use `record_outcome`.
    pub async fn reschedule(&self, id: &str, found: bool) -> Result<i64> {
        self.reschedule_at(id, found, Utc::now()).await
    }

    pub async fn reschedule_at(&self, id: &str, found: bool, now: DateTime<Utc>) -> Result<i64> {
        let due = self.next_due_time(found, now);
        self.backend.set_due(id, due).await?;
        self.backend.refresh_expiry(self.config.ttl()).await?;
        Ok(due)
    }

    pub async fn update_meta(&self, id: &str, found: bool) -> Result<EntityMeta> {
        self.update_meta_at(id, found, Utc::now()).await
    }

    pub async fn update_meta_at(
        &self,
        id: &str,
        found: bool,
        now: DateTime<Utc>,
    ) -> Result<EntityMeta> {
        let previous = self.backend.get_meta(id).await?;
        let meta = EntityMeta::after_outcome(previous.as_ref(), found, now.timestamp());
        self.backend.set_meta(id, &meta).await?;
        self.backend.refresh_expiry(self.config.ttl()).await?;
        Ok(meta)
    }

    /// Reschedule and update metadata for one entity as a single write
    pub async fn record_outcome(&self, id: &str, found: bool) -> Result<i64> {
        self.record_outcome_at(id, found, Utc::now()).await
    }

    pub async fn record_outcome_at(&self, id: &str, found: bool, now: DateTime<Utc>) -> Result<i64> {
        let previous = self.backend.get_meta(id).await?;
        let meta = EntityMeta::after_outcome(previous.as_ref(), found, now.timestamp());
        let due = self.next_due_time(found, now);
        self.backend
            .commit_outcome(id, due, &meta, self.config.ttl())
            .await?;
        Ok(due)
    }

    pub async fn refresh_expiry(&self) -> Result<()> {
        self.backend.refresh_expiry(self.config.ttl()).await
    }

    pub async fn due_time(&self, id: &str) -> Result<Option<i64>> {
        self.backend.due_time(id).await
    }

    pub async fn meta(&self, id: &str) -> Result<Option<EntityMeta>> {
        self.backend.get_meta(id).await
    }

    pub async fn scheduled_count(&self) -> Result<usize> {
        let count = self.backend.scheduled_count().await?;
        metrics::gauge!("poller.schedule.size").set(count as f64);
        Ok(count)
    }

    pub async fn next_due(&self) -> Result<Option<(String, i64)>> {
        self.backend.next_due().await
    }
}

#[derive(Default)]
struct MemoryState {
    schedule: HashMap<String, i64>,
    meta: HashMap<String, EntityMeta>,
    schedule_expires_at: Option<Instant>,
    meta_expires_at: Option<Instant>,
}

impl MemoryState {
    /// Drop whichever structure has outlived its expiry, like a key TTL would
    fn purge_expired(&mut self) {
        let now = Instant::now();
        if self.schedule_expires_at.is_some_and(|at| at <= now) {
            self.schedule.clear();
            self.schedule_expires_at = None;
        }
        if self.meta_expires_at.is_some_and(|at| at <= now) {
            self.meta.clear();
            self.meta_expires_at = None;
        }
    }

    fn set_expiry(&mut self, ttl: Duration) {
        let at = Instant::now() + ttl;
        // Expiry only attaches to structures that exist
        self.schedule_expires_at = (!self.schedule.is_empty()).then_some(at);
        self.meta_expires_at = (!self.meta.is_empty()).then_some(at);
    }

    fn sorted_schedule(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .schedule
            .iter()
            .map(|(id, due)| (id.clone(), *due))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

/// In-process schedule backend, used by `--memory-schedule` and tests.
/// State does not survive a restart.
#[derive(Default)]
pub struct MemoryScheduleBackend {
    state: Mutex<MemoryState>,
}

impl MemoryScheduleBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleBackend for MemoryScheduleBackend {
    async fn add_if_absent(&self, ids: &[String], due: i64, now: i64) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let mut added = 0;
        for id in ids {
            if !state.schedule.contains_key(id) {
                state.schedule.insert(id.clone(), due);
                added += 1;
            }
            state
                .meta
                .entry(id.clone())
                .or_insert_with(|| EntityMeta::unknown(now));
        }
        Ok(added)
    }

    async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let claimed: Vec<String> = state
            .sorted_schedule()
            .into_iter()
            .take_while(|(_, due)| *due <= now)
            .take(limit)
            .map(|(id, _)| id)
            .collect();
        for id in &claimed {
            state.schedule.remove(id);
        }
        Ok(claimed)
    }

    async fn set_due(&self, id: &str, due: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.schedule.insert(id.to_string(), due);
        Ok(())
    }

    async fn get_meta(&self, id: &str) -> Result<Option<EntityMeta>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.meta.get(id).cloned())
    }

    async fn set_meta(&self, id: &str, meta: &EntityMeta) -> Result<()> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.meta.insert(id.to_string(), meta.clone());
        Ok(())
    }

    async fn commit_outcome(
        &self,
        id: &str,
        due: i64,
        meta: &EntityMeta,
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.schedule.insert(id.to_string(), due);
        state.meta.insert(id.to_string(), meta.clone());
        state.set_expiry(ttl);
        Ok(())
    }

    async fn refresh_expiry(&self, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.set_expiry(ttl);
        Ok(())
    }

    async fn due_time(&self, id: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.schedule.get(id).copied())
    }

    async fn scheduled_count(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.schedule.len())
    }

    async fn next_due(&self) -> Result<Option<(String, i64)>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.sorted_schedule().into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn store() -> PollingScheduleStore {
        PollingScheduleStore::new(
            Arc::new(MemoryScheduleBackend::new()),
            ScheduleConfig::default(),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let store = store();
        let now = t0();

        let added = store.bootstrap_at(&ids(&["AB-123", "CD-456"]), now).await.unwrap();
        assert_eq!(added, 2);

        let later = now + chrono::Duration::minutes(5);
        let added = store
            .bootstrap_at(&ids(&["AB-123", "CD-456", "EF-789"]), later)
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.scheduled_count().await.unwrap(), 3);

        // Existing entries keep their original due time
        assert_eq!(store.due_time("AB-123").await.unwrap(), Some(now.timestamp()));
        assert_eq!(store.due_time("EF-789").await.unwrap(), Some(later.timestamp()));
    }

    #[tokio::test]
    async fn test_bootstrap_normalises_and_ignores_blank_ids() {
        let store = store();
        let now = t0();

        let added = store
            .bootstrap_at(&ids(&["", "   ", "ab-123", " AB-123 ", "cd-456"]), now)
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.scheduled_count().await.unwrap(), 2);

        let claimed = store.claim_due_at(10, now).await.unwrap();
        assert_eq!(claimed, ids(&["AB-123", "CD-456"]));

        assert_eq!(store.bootstrap_at(&ids(&["", " "]), now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_does_not_disturb_rescheduled_entity() {
        let store = store();
        let now = t0();
        store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap();
        store.claim_due_at(10, now).await.unwrap();
        let due = store.record_outcome_at("AB-123", true, now).await.unwrap();

        store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap();
        assert_eq!(store.due_time("AB-123").await.unwrap(), Some(due));
        assert_eq!(store.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_dedups_input() {
        let store = store();
        let added = store
            .bootstrap_at(&ids(&["AB-123", "AB-123", "AB-123"]), t0())
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_creates_unknown_meta() {
        let store = store();
        store.bootstrap_at(&ids(&["AB-123"]), t0()).await.unwrap();
        let meta = store.meta("AB-123").await.unwrap().unwrap();
        assert_eq!(meta.state, EntityState::Unknown);
        assert_eq!(meta.last_seen_timestamp, None);
    }

    #[tokio::test]
    async fn test_claim_due_respects_limit_and_order() {
        let store = store();
        let now = t0();
        store.bootstrap_at(&ids(&["C"]), now - chrono::Duration::minutes(1)).await.unwrap();
        store.bootstrap_at(&ids(&["A"]), now - chrono::Duration::minutes(3)).await.unwrap();
        store.bootstrap_at(&ids(&["B"]), now - chrono::Duration::minutes(2)).await.unwrap();

        let claimed = store.claim_due_at(2, now).await.unwrap();
        assert_eq!(claimed, ids(&["A", "B"]));

        let claimed = store.claim_due_at(2, now).await.unwrap();
        assert_eq!(claimed, ids(&["C"]));

        assert!(store.claim_due_at(2, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_due_skips_future_entries() {
        let store = store();
        let now = t0();
        store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap();
        store.claim_due_at(10, now).await.unwrap();
        store.record_outcome_at("AB-123", true, now).await.unwrap();

        assert!(store.claim_due_at(10, now).await.unwrap().is_empty());
        let due_later = now + chrono::Duration::seconds(900);
        assert_eq!(store.claim_due_at(10, due_later).await.unwrap(), ids(&["AB-123"]));
    }

    #[tokio::test]
    async fn test_claim_due_zero_limit() {
        let store = store();
        store.bootstrap_at(&ids(&["AB-123"]), t0()).await.unwrap();
        assert!(store.claim_due_at(0, t0()).await.unwrap().is_empty());
        assert_eq!(store.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let store = store();
        let now = t0();
        let fleet: Vec<String> = (0..100).map(|i| format!("REG-{i:03}")).collect();
        store.bootstrap_at(&fleet, now).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_due_at(15, now).await }));
        }

        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for handle in handles {
            let claimed = handle.await.unwrap().unwrap();
            assert!(claimed.len() <= 15);
            total += claimed.len();
            for id in claimed {
                assert!(seen.insert(id), "entity claimed twice");
            }
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_reschedule_intervals() {
        let store = store();
        let now = t0();

        let found_due = store.reschedule_at("AB-123", true, now).await.unwrap();
        let missed_due = store.reschedule_at("CD-456", false, now).await.unwrap();

        assert_eq!(found_due - now.timestamp(), 900);
        assert_eq!(missed_due - now.timestamp(), 1800);
        assert!(found_due > now.timestamp());
        assert!(missed_due > found_due);
    }

    #[tokio::test]
    async fn test_reschedule_never_duplicates() {
        let store = store();
        let now = t0();
        store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap();
        store.reschedule_at("AB-123", true, now).await.unwrap();
        store.reschedule_at("AB-123", false, now).await.unwrap();
        store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap();

        assert_eq!(store.scheduled_count().await.unwrap(), 1);
        assert_eq!(
            store.due_time("AB-123").await.unwrap(),
            Some(now.timestamp() + 1800)
        );
    }

    #[tokio::test]
    async fn test_update_meta_found_then_missed() {
        let store = store();
        let now = t0();

        let meta = store.update_meta_at("AB-123", true, now).await.unwrap();
        assert_eq!(meta.state, EntityState::Airborne);
        assert_eq!(meta.last_seen_timestamp, Some(now.timestamp()));

        let later = now + chrono::Duration::minutes(15);
        let meta = store.update_meta_at("AB-123", false, later).await.unwrap();
        assert_eq!(meta.state, EntityState::Ground);
        // Last seen stays at the last found outcome
        assert_eq!(meta.last_seen_timestamp, Some(now.timestamp()));
        assert_eq!(meta.updated_at_timestamp, later.timestamp());
    }

    #[tokio::test]
    async fn test_record_outcome_writes_both_views() {
        let store = store();
        let now = t0();
        store.bootstrap_at(&ids(&["AB-123", "CD-456"]), now).await.unwrap();
        store.claim_due_at(10, now).await.unwrap();

        store.record_outcome_at("AB-123", true, now).await.unwrap();
        store.record_outcome_at("CD-456", false, now).await.unwrap();

        let ab = store.meta("AB-123").await.unwrap().unwrap();
        assert_eq!(ab.state, EntityState::Airborne);
        assert_eq!(store.due_time("AB-123").await.unwrap(), Some(now.timestamp() + 900));

        let cd = store.meta("CD-456").await.unwrap().unwrap();
        assert_eq!(cd.state, EntityState::Ground);
        assert_eq!(cd.last_seen_timestamp, None);
        assert_eq!(store.due_time("CD-456").await.unwrap(), Some(now.timestamp() + 1800));
    }

    #[tokio::test]
    async fn test_next_due_returns_oldest_entry() {
        let store = store();
        let now = t0();
        store.reschedule_at("AB-123", false, now).await.unwrap();
        store.reschedule_at("CD-456", true, now).await.unwrap();

        let (id, due) = store.next_due().await.unwrap().unwrap();
        assert_eq!(id, "CD-456");
        assert_eq!(due, now.timestamp() + 900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattended_schedule_expires() {
        let config = ScheduleConfig {
            ttl_secs: 60,
            ..Default::default()
        };
        let store = PollingScheduleStore::new(Arc::new(MemoryScheduleBackend::new()), config);
        let now = t0();
        store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        store.refresh_expiry().await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(store.scheduled_count().await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.scheduled_count().await.unwrap(), 0);
        assert!(store.meta("AB-123").await.unwrap().is_none());

        // An expired fleet is re-admitted cleanly
        assert_eq!(store.bootstrap_at(&ids(&["AB-123"]), now).await.unwrap(), 1);
    }

    #[test]
    fn test_meta_json_shape() {
        let meta = EntityMeta {
            state: EntityState::Airborne,
            last_seen_timestamp: Some(1_700_000_000),
            updated_at_timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["state"], "airborne");
        assert_eq!(json["last_seen_timestamp"], 1_700_000_000);
    }
}
