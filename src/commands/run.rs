use anyhow::Result;
use tracing::{error, info};

use aerotrack::config::PollerConfig;

pub async fn handle_run(config: PollerConfig, memory_schedule: bool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "run");
    });
    info!("Starting live position poller");

    aerotrack::metrics::install_poller_metrics()?;
    let metrics_port = config.trigger.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = aerotrack::metrics::start_metrics_server(metrics_port).await {
            error!("Metrics server stopped: {:#}", e);
        }
    });

    let trigger = super::build_trigger(&config, memory_schedule).await?;

    trigger
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
                Err(e) => error!("Unable to listen for shutdown signal: {}", e),
            }
        })
        .await
}
