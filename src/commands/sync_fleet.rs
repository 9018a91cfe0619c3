use anyhow::Result;
use tracing::info;

use aerotrack::config::PollerConfig;
use aerotrack::registrations_repo::{FleetRegistry, RegistrationsRepository};

/// Admit all tracked registrations into the polling schedule without polling
pub async fn handle_sync_fleet(config: PollerConfig, memory_schedule: bool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "sync-fleet");
    });

    let pool = super::connect_database(&config)?;
    let store = super::build_schedule_store(&config, memory_schedule).await?;
    let registrations = RegistrationsRepository::new(pool)
        .active_registrations()
        .await?;

    let added = store.bootstrap(&registrations).await?;
    let scheduled = store.scheduled_count().await?;
    info!(
        fleet = registrations.len(),
        added, scheduled, "Fleet sync complete"
    );
    Ok(())
}
