use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        // Cycle duration buckets: 50ms .. 2min
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("poller.cycle.duration_ms".to_string()),
            &[
                50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
                120000.0,
            ],
        )
        .context("Failed to set buckets for poller.cycle.duration_ms")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Uptime and resident memory, refreshed every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|line| line.starts_with("VmRSS:"))
                && let Some(kb_str) = line.split_whitespace().nth(1)
                && let Ok(kb) = kb_str.parse::<f64>()
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize poller metrics to zero so they show up before the first cycle
pub fn initialize_poller_metrics() {
    metrics::counter!("poller.cycle.completed").absolute(0);
    metrics::counter!("poller.cycle.failed").absolute(0);
    metrics::counter!("poller.cycle.skipped_overlap").absolute(0);

    metrics::counter!("poller.entities.claimed").absolute(0);
    metrics::counter!("poller.entities.found").absolute(0);
    metrics::counter!("poller.entities.missing").absolute(0);

    metrics::counter!("poller.batch.sent").absolute(0);
    metrics::counter!("poller.batch.failed").absolute(0);

    metrics::counter!("poller.samples.persisted").absolute(0);
    metrics::counter!("poller.samples.persist_failed").absolute(0);
    metrics::counter!("poller.records.skipped").absolute(0);

    metrics::counter!("poller.fleet.admitted").absolute(0);
    metrics::gauge!("poller.schedule.size").set(0.0);
}

/// Install the recorder, then zero the poller metrics on it.
/// Zeroing before the recorder exists goes to the no-op recorder and is lost.
pub fn install_poller_metrics() -> Result<PrometheusHandle> {
    let handle = init_metrics()?;
    initialize_poller_metrics();
    Ok(handle)
}

/// Serve `/metrics` on the given port until the listener fails
pub async fn start_metrics_server(port: u16) -> Result<()> {
    let handle = init_metrics()?;
    tokio::spawn(process_metrics_task());

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    axum::serve(listener, app)
        .await
        .context("Metrics server failed")?;
    Ok(())
}
