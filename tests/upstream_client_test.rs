//! Live positions client against a local HTTP server
mod common;

use aerotrack::config::{DistanceConfig, ScheduleConfig, UpstreamConfig};
use aerotrack::cycle_runner::CycleRunner;
use aerotrack::distance::DistanceEstimator;
use aerotrack::polling_schedule::{EntityState, MemoryScheduleBackend, PollingScheduleStore};
use aerotrack::upstream_client::{LivePositionsClient, PositionSource};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use common::{InMemoryAirports, InMemorySamples};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct Upstream {
    requests: Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>,
    status: Option<StatusCode>,
    delay: Option<Duration>,
}

async fn positions(
    State(upstream): State<Upstream>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let registrations = params.get("registrations").cloned().unwrap_or_default();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    upstream.requests.lock().unwrap().push((
        registrations.clone(),
        header("authorization"),
        header("accept-version"),
    ));

    if let Some(delay) = upstream.delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(status) = upstream.status {
        return (status, "upstream unavailable".to_string());
    }

    let data: Vec<serde_json::Value> = registrations
        .split(',')
        .filter(|reg| *reg == "AB-123")
        .map(|reg| {
            serde_json::json!({
                "fr24_id": "39a84c3c",
                "reg": reg,
                "lat": 51.4706,
                "lon": -0.4619,
                "gspeed": 0,
                "orig_iata": "LHR",
                "timestamp": "2026-03-01T12:00:00Z"
            })
        })
        .collect();
    (StatusCode::OK, serde_json::json!({ "data": data }).to_string())
}

async fn spawn_upstream(upstream: Upstream) -> SocketAddr {
    let app = Router::new()
        .route("/api/live/flight-positions/full", get(positions))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_config(addr: SocketAddr) -> UpstreamConfig {
    UpstreamConfig {
        base_url: format!("http://{}/api", addr),
        api_key: Some("test-token".to_string()),
        request_timeout_secs: 1,
        min_request_interval_ms: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fetch_sends_joined_registrations_and_auth() {
    let upstream = Upstream::default();
    let addr = spawn_upstream(upstream.clone()).await;
    let client = LivePositionsClient::new(&client_config(addr)).unwrap();

    let records = client
        .fetch_positions(&["AB-123".to_string(), "CD-456".to_string()])
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].registration().as_deref(), Some("AB-123"));

    let requests = upstream.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "AB-123,CD-456");
    assert_eq!(requests[0].1.as_deref(), Some("Bearer test-token"));
    assert_eq!(requests[0].2.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let upstream = Upstream {
        status: Some(StatusCode::TOO_MANY_REQUESTS),
        ..Default::default()
    };
    let addr = spawn_upstream(upstream).await;
    let client = LivePositionsClient::new(&client_config(addr)).unwrap();

    let err = client
        .fetch_positions(&["AB-123".to_string()])
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("429"));
}

#[tokio::test]
async fn test_timed_out_batch_reschedules_entities_as_missed() {
    let upstream = Upstream {
        delay: Some(Duration::from_secs(3)),
        ..Default::default()
    };
    let addr = spawn_upstream(upstream).await;

    let store = PollingScheduleStore::new(
        Arc::new(MemoryScheduleBackend::new()),
        ScheduleConfig::default(),
    );
    let samples = Arc::new(InMemorySamples::default());
    let estimator = DistanceEstimator::new(
        samples.clone(),
        Arc::new(InMemoryAirports::default()),
        DistanceConfig::default(),
    );
    let runner = CycleRunner::new(
        store.clone(),
        Arc::new(LivePositionsClient::new(&client_config(addr)).unwrap()),
        estimator,
        samples.clone(),
        client_config(addr),
    );

    let now = Utc::now();
    let batch = vec!["AB-123".to_string(), "CD-456".to_string()];
    store.bootstrap_at(&batch, now).await.unwrap();

    let summary = runner.run_cycle_at(now).await.unwrap();
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.missing, 2);
    assert!(samples.all().is_empty());

    let missed = store.config().interval_missed().as_secs() as i64;
    for id in &batch {
        assert_eq!(
            store.meta(id).await.unwrap().unwrap().state,
            EntityState::Ground
        );
        assert_eq!(store.due_time(id).await.unwrap(), Some(now.timestamp() + missed));
    }
}
