use anyhow::{Context, Result};
use tracing::info;

use aerotrack::config::PollerConfig;

/// Sync the fleet and run exactly one polling cycle, printing the summary as JSON
pub async fn handle_cycle(config: PollerConfig, memory_schedule: bool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "cycle");
    });

    let trigger = super::build_trigger(&config, memory_schedule).await?;
    let added = trigger.sync_fleet().await?;
    info!("Fleet sync admitted {} new registration(s)", added);

    let summary = trigger
        .fire()
        .await
        .context("A polling cycle is already running")??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
