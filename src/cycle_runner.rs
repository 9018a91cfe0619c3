use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::UpstreamConfig;
use crate::distance::DistanceEstimator;
use crate::live_positions::LivePositionSample;
use crate::polling_schedule::PollingScheduleStore;
use crate::upstream_client::PositionSource;

/// Durable destination for enriched samples
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn persist(&self, sample: &LivePositionSample) -> Result<()>;
}

/// Counts reported at the end of every cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub claimed: usize,
    pub batches: usize,
    pub batches_failed: usize,
    pub found: usize,
    pub missing: usize,
    pub samples_persisted: usize,
    pub samples_failed: usize,
    pub records_skipped: usize,
    pub reschedule_failed: usize,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    found: HashSet<String>,
    failed: bool,
    persisted: usize,
    persist_failed: usize,
    skipped: usize,
}

const NEVER: i64 = i64::MIN;

/// Runs one polling cycle: claim, fetch in batches, enrich, persist, reschedule.
pub struct CycleRunner {
    store: PollingScheduleStore,
    source: Arc<dyn PositionSource>,
    estimator: DistanceEstimator,
    sink: Arc<dyn SampleSink>,
    upstream: UpstreamConfig,
    last_cycle_completed_at: AtomicI64,
}

impl CycleRunner {
    pub fn new(
        store: PollingScheduleStore,
        source: Arc<dyn PositionSource>,
        estimator: DistanceEstimator,
        sink: Arc<dyn SampleSink>,
        upstream: UpstreamConfig,
    ) -> Self {
        Self {
            store,
            source,
            estimator,
            sink,
            upstream,
            last_cycle_completed_at: AtomicI64::new(NEVER),
        }
    }

    pub fn store(&self) -> &PollingScheduleStore {
        &self.store
    }

    /// When the last cycle finished, `None` before the first one
    pub fn last_cycle_completed_at(&self) -> Option<DateTime<Utc>> {
        match self.last_cycle_completed_at.load(Ordering::Acquire) {
            NEVER => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run a cycle as of `now`. Only a failed claim is returned as an error;
    /// everything after the claim is handled per batch or per entity.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let started = Instant::now();
        if self.last_cycle_completed_at().is_none() {
            info!("Running first polling cycle since start");
        }

        let due_limit = self.store.config().due_limit;
        let claimed = self.store.claim_due_at(due_limit, now).await?;
        metrics::counter!("poller.entities.claimed").increment(claimed.len() as u64);

        let mut summary = CycleSummary {
            claimed: claimed.len(),
            ..Default::default()
        };

        if claimed.is_empty() {
            debug!("No entities due, skipping upstream");
            self.finish(&summary, started);
            return Ok(summary);
        }

        let batch_size = self.upstream.batch_size.max(1);
        let batches: Vec<Vec<String>> = claimed.chunks(batch_size).map(<[String]>::to_vec).collect();
        summary.batches = batches.len();

        let outcomes = self.process_batches(batches, now).await;

        let mut found: HashSet<String> = HashSet::new();
        for outcome in outcomes {
            if outcome.failed {
                summary.batches_failed += 1;
            }
            summary.samples_persisted += outcome.persisted;
            summary.samples_failed += outcome.persist_failed;
            summary.records_skipped += outcome.skipped;
            found.extend(outcome.found);
        }

        // Every claimed entity leaves the cycle with a fresh due time
        for id in &claimed {
            let was_found = found.contains(id);
            if was_found {
                summary.found += 1;
            } else {
                summary.missing += 1;
            }

            if let Err(e) = self.store.record_outcome_at(id, was_found, now).await {
                summary.reschedule_failed += 1;
                error!(entity = %id, found = was_found, "Failed to reschedule entity: {:#}", e);
            }
        }

        metrics::counter!("poller.entities.found").increment(summary.found as u64);
        metrics::counter!("poller.entities.missing").increment(summary.missing as u64);
        if summary.reschedule_failed > 0 {
            warn!(
                failed = summary.reschedule_failed,
                "Some entities were not rescheduled, they return on the next fleet sync"
            );
        }

        self.finish(&summary, started);
        Ok(summary)
    }

    fn finish(&self, summary: &CycleSummary, started: Instant) {
        let elapsed = started.elapsed();
        self.last_cycle_completed_at
            .store(Utc::now().timestamp_millis(), Ordering::Release);

        metrics::counter!("poller.cycle.completed").increment(1);
        metrics::histogram!("poller.cycle.duration_ms").record(elapsed.as_millis() as f64);

        info!(
            claimed = summary.claimed,
            batches = summary.batches,
            batches_failed = summary.batches_failed,
            found = summary.found,
            missing = summary.missing,
            persisted = summary.samples_persisted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Polling cycle complete"
        );
    }

    async fn process_batches(&self, batches: Vec<Vec<String>>, now: DateTime<Utc>) -> Vec<BatchOutcome> {
        let max_concurrent = self.upstream.max_concurrent_batches.max(1);

        if max_concurrent == 1 {
            // Sequential requests honour the minimum inter-request delay
            let pacing = self.upstream.min_request_interval();
            let mut outcomes = Vec::with_capacity(batches.len());
            for (index, batch) in batches.iter().enumerate() {
                if index > 0 && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                outcomes.push(self.process_batch(batch, now).await);
            }
            return outcomes;
        }

        stream::iter(batches)
            .map(|batch| async move { self.process_batch(&batch, now).await })
            .buffer_unordered(max_concurrent)
            .collect()
            .await
    }

    async fn process_batch(&self, batch: &[String], now: DateTime<Utc>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        metrics::counter!("poller.batch.sent").increment(1);

        let records = match self.source.fetch_positions(batch).await {
            Ok(records) => records,
            Err(e) => {
                metrics::counter!("poller.batch.failed").increment(1);
                warn!(
                    size = batch.len(),
                    first = batch.first().map(String::as_str).unwrap_or_default(),
                    "Batch fetch failed, treating entities as not found: {:#}",
                    e
                );
                outcome.failed = true;
                return outcome;
            }
        };

        debug!(size = batch.len(), records = records.len(), "Batch fetched");
        let members: HashSet<&str> = batch.iter().map(String::as_str).collect();

        for record in records {
            let Some(registration) = record
                .registration()
                .filter(|reg| members.contains(reg.as_str()))
            else {
                outcome.skipped += 1;
                metrics::counter!("poller.records.skipped").increment(1);
                warn!(
                    reg = record.reg.as_deref().unwrap_or_default(),
                    fr24_id = record.fr24_id.as_deref().unwrap_or_default(),
                    "Record does not match any entity in the batch, skipping"
                );
                continue;
            };

            outcome.found.insert(registration.clone());

            let estimate = self.estimator.estimate(&registration, &record, now).await;
            let sample = LivePositionSample::from_record(registration, record, estimate.distance_km, now);

            match self.sink.persist(&sample).await {
                Ok(()) => {
                    outcome.persisted += 1;
                    metrics::counter!("poller.samples.persisted").increment(1);
                }
                Err(e) => {
                    // Still counts as found: the upstream did see the aircraft
                    outcome.persist_failed += 1;
                    metrics::counter!("poller.samples.persist_failed").increment(1);
                    error!(
                        registration = %sample.registration,
                        "Failed to persist live position sample: {:#}",
                        e
                    );
                }
            }
        }

        outcome
    }
}
