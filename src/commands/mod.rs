pub mod cycle;
pub mod migrate;
pub mod run;
pub mod status;
pub mod sync_fleet;

pub use cycle::handle_cycle;
pub use migrate::handle_migrate;
pub use run::handle_run;
pub use status::handle_status;
pub use sync_fleet::handle_sync_fleet;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use aerotrack::airports_repo::{AirportsRepository, CachedReferencePoints};
use aerotrack::config::PollerConfig;
use aerotrack::cycle_runner::CycleRunner;
use aerotrack::database::{PgPool, create_pool};
use aerotrack::distance::DistanceEstimator;
use aerotrack::live_positions_repo::LivePositionsRepository;
use aerotrack::polling_schedule::{MemoryScheduleBackend, PollingScheduleStore, ScheduleBackend};
use aerotrack::polling_schedule_redis::RedisScheduleBackend;
use aerotrack::registrations_repo::RegistrationsRepository;
use aerotrack::trigger::CycleTrigger;
use aerotrack::upstream_client::LivePositionsClient;

const DB_POOL_SIZE: u32 = 10;

/// Open the database pool from config
pub fn connect_database(config: &PollerConfig) -> Result<PgPool> {
    let database_url = config.require_database_url()?;
    let pool = create_pool(database_url, DB_POOL_SIZE)?;
    info!("Connected to PostgreSQL (pool size {})", DB_POOL_SIZE);
    Ok(pool)
}

/// Build the schedule store on Redis, or in memory when requested
pub async fn build_schedule_store(
    config: &PollerConfig,
    memory_schedule: bool,
) -> Result<PollingScheduleStore> {
    let backend: Arc<dyn ScheduleBackend> = if memory_schedule {
        warn!("Using in-memory polling schedule, state is lost on restart");
        Arc::new(MemoryScheduleBackend::new())
    } else {
        let redis_url = config.require_redis_url()?;
        Arc::new(RedisScheduleBackend::connect(redis_url, &config.schedule).await?)
    };
    Ok(PollingScheduleStore::new(backend, config.schedule.clone()))
}

/// Fully wired trigger: schedule store, upstream client, estimator, sample sink and fleet registry
pub async fn build_trigger(config: &PollerConfig, memory_schedule: bool) -> Result<CycleTrigger> {
    let pool = connect_database(config)?;
    let store = build_schedule_store(config, memory_schedule).await?;

    let samples = Arc::new(LivePositionsRepository::new(pool.clone()));
    let reference_points = Arc::new(CachedReferencePoints::new(
        AirportsRepository::new(pool.clone()),
        config.distance.reference_cache_ttl(),
    ));
    let estimator = DistanceEstimator::new(
        samples.clone(),
        reference_points,
        config.distance.clone(),
    );
    let source = Arc::new(LivePositionsClient::new(&config.upstream)?);

    let runner = Arc::new(CycleRunner::new(
        store,
        source,
        estimator,
        samples,
        config.upstream.clone(),
    ));
    let fleet = Arc::new(RegistrationsRepository::new(pool));

    Ok(CycleTrigger::new(runner, fleet, config.trigger.clone()))
}
