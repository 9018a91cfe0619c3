use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, debug, error, info, warn};

use crate::config::TriggerConfig;
use crate::cycle_runner::{CycleRunner, CycleSummary};
use crate::registrations_repo::FleetRegistry;

/// Releases the in-flight flag when the cycle future completes or is dropped
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fires polling cycles on a fixed cadence and admits newly tracked
/// registrations into the schedule. At most one cycle runs at a time; a tick
/// that lands while a cycle is still running is dropped, not queued.
#[derive(Clone)]
pub struct CycleTrigger {
    runner: Arc<CycleRunner>,
    fleet: Arc<dyn FleetRegistry>,
    config: TriggerConfig,
    in_flight: Arc<AtomicBool>,
}

impl CycleTrigger {
    pub fn new(
        runner: Arc<CycleRunner>,
        fleet: Arc<dyn FleetRegistry>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            runner,
            fleet,
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cycle_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the in-flight flag, or count the attempt as a coalesced overlap
    fn try_begin_cycle(&self) -> Option<InFlightGuard> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::counter!("poller.cycle.skipped_overlap").increment(1);
            debug!("Cycle already in flight, skipping trigger");
            return None;
        }
        Some(InFlightGuard(self.in_flight.clone()))
    }

    async fn run_claimed_cycle(&self, _guard: InFlightGuard) -> Result<CycleSummary> {
        let result = self.runner.run_cycle().await;
        if let Err(e) = &result {
            metrics::counter!("poller.cycle.failed").increment(1);
            error!("Polling cycle failed: {:#}", e);
        }
        result
    }

    /// Run one cycle unless another is in flight. Returns `None` when the fire was coalesced.
    pub async fn fire(&self) -> Option<Result<CycleSummary>> {
        let guard = self.try_begin_cycle()?;
        Some(self.run_claimed_cycle(guard).await)
    }

    /// Start a cycle on its own task. The flag is claimed before spawning, so a
    /// returned handle always belongs to a cycle that is actually running.
    pub fn spawn_cycle(&self) -> Option<JoinHandle<()>> {
        let guard = self.try_begin_cycle()?;
        let trigger = self.clone();
        Some(tokio::spawn(
            async move {
                let _ = trigger.run_claimed_cycle(guard).await;
            }
            .instrument(tracing::info_span!("polling_cycle")),
        ))
    }

    /// Admit every actively tracked registration that is not scheduled yet
    pub async fn sync_fleet(&self) -> Result<usize> {
        let registrations = self.fleet.active_registrations().await?;
        let added = self.runner.store().bootstrap(&registrations).await?;
        debug!(
            fleet = registrations.len(),
            added, "Fleet synced into polling schedule"
        );
        Ok(added)
    }

    /// Drive fleet sync and cycles until `shutdown` resolves, then wait for the
    /// in-flight cycle to finish
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            cycle_interval_secs = self.config.cycle_interval_secs,
            fleet_sync_interval_secs = self.config.fleet_sync_interval_secs,
            "Starting polling trigger"
        );

        let mut cycle_tick = interval(self.config.cycle_interval());
        cycle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fleet_tick = interval(self.config.fleet_sync_interval());
        fleet_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);
        let mut current: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping polling trigger");
                    break;
                }
                _ = fleet_tick.tick() => {
                    if let Err(e) = self.sync_fleet().await {
                        // Already scheduled entities keep polling without a registry
                        warn!("Fleet sync failed: {:#}", e);
                    }
                }
                _ = cycle_tick.tick() => {
                    if let Some(handle) = self.spawn_cycle() {
                        current = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = current
            && !handle.is_finished()
        {
            info!("Waiting for in-flight cycle to finish");
            if let Err(e) = handle.await {
                error!("Polling cycle task panicked: {}", e);
            }
        }

        info!("Polling trigger stopped");
        Ok(())
    }
}
