use anyhow::Result;
use tracing::info;

use aerotrack::config::PollerConfig;
use aerotrack::database::run_migrations;

pub async fn handle_migrate(config: PollerConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "migrate");
    });

    let pool = super::connect_database(&config)?;
    let applied = run_migrations(&pool).await?;
    if applied == 0 {
        info!("Database schema is up to date");
    }
    Ok(())
}
