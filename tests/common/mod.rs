//! Shared helpers for integration tests.
//!
//! In-memory fakes stand in for the upstream API, the sample table, the
//! airports table and the fleet registry so the polling flow can be tested
//! without external services.
//!
//! `TestDatabase` and `test_redis_url` give access to real backends when
//! `TEST_DATABASE_URL` / `TEST_REDIS_URL` are set. Without them those tests
//! print `SKIPPED: <VAR> not set` and return early. CI starts PostgreSQL and
//! Redis service containers, exports both URLs and sets
//! `AEROTRACK_REQUIRE_BACKENDS=1`, which turns a missing URL into a failure
//! instead of a silent pass.
#![allow(dead_code)]

use aerotrack::config::{DistanceConfig, ScheduleConfig, UpstreamConfig};
use aerotrack::cycle_runner::{CycleRunner, SampleSink};
use aerotrack::distance::{DistanceEstimator, ReferencePoints, SampleHistory};
use aerotrack::live_positions::{FlightPositionRecord, LivePositionSample};
use aerotrack::polling_schedule::{MemoryScheduleBackend, PollingScheduleStore};
use aerotrack::registrations_repo::FleetRegistry;
use aerotrack::upstream_client::PositionSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Upstream fake keyed by registration. Registrations in `failing` make the whole
/// batch error; `delay` simulates a slow upstream.
#[derive(Default)]
pub struct FakePositionSource {
    pub records: Mutex<HashMap<String, Vec<FlightPositionRecord>>>,
    pub failing: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<Vec<String>>>,
    pub delay: Option<Duration>,
    /// When set, every fetch waits for `release` after signalling `started`
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakePositionSource {
    pub fn with_record(self, record: FlightPositionRecord) -> Self {
        let reg = record.registration().unwrap_or_default();
        self.records.lock().unwrap().entry(reg).or_default().push(record);
        self
    }

    pub fn failing_for(self, registration: &str) -> Self {
        self.failing.lock().unwrap().insert(registration.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PositionSource for FakePositionSource {
    async fn fetch_positions(&self, registrations: &[String]) -> Result<Vec<FlightPositionRecord>> {
        self.calls.lock().unwrap().push(registrations.to_vec());

        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing.lock().unwrap();
        if registrations.iter().any(|r| failing.contains(r)) {
            anyhow::bail!("request timed out");
        }
        let records = self.records.lock().unwrap();
        Ok(registrations
            .iter()
            .flat_map(|r| records.get(r).cloned().unwrap_or_default())
            .collect())
    }
}

/// Sample table fake serving both the sink and the history lookup
#[derive(Default)]
pub struct InMemorySamples {
    pub samples: Mutex<Vec<LivePositionSample>>,
}

impl InMemorySamples {
    pub fn all(&self) -> Vec<LivePositionSample> {
        self.samples.lock().unwrap().clone()
    }
}

#[async_trait]
impl SampleSink for InMemorySamples {
    async fn persist(&self, sample: &LivePositionSample) -> Result<()> {
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }
}

#[async_trait]
impl SampleHistory for InMemorySamples {
    async fn latest_prior_sample(
        &self,
        registration: &str,
        flight_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LivePositionSample>> {
        Ok(self
            .samples
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.registration == registration
                    && s.flight_id.as_deref() == flight_id
                    && s.created_at >= since
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryAirports {
    pub airports: HashMap<String, (f64, f64)>,
}

impl InMemoryAirports {
    pub fn with(code: &str, lat: f64, lon: f64) -> Self {
        Self {
            airports: [(code.to_string(), (lat, lon))].into_iter().collect(),
        }
    }
}

#[async_trait]
impl ReferencePoints for InMemoryAirports {
    async fn coordinates(&self, code: &str) -> Result<Option<(f64, f64)>> {
        Ok(self.airports.get(code).copied())
    }
}

#[derive(Default)]
pub struct FakeFleet {
    pub registrations: Mutex<Vec<String>>,
    pub fail: bool,
}

impl FakeFleet {
    pub fn new(registrations: &[&str]) -> Self {
        Self {
            registrations: Mutex::new(registrations.iter().map(|r| r.to_string()).collect()),
            fail: false,
        }
    }
}

#[async_trait]
impl FleetRegistry for FakeFleet {
    async fn active_registrations(&self) -> Result<Vec<String>> {
        if self.fail {
            anyhow::bail!("registry unavailable");
        }
        Ok(self.registrations.lock().unwrap().clone())
    }
}

pub fn position(registration: &str, lat: f64, lon: f64) -> FlightPositionRecord {
    FlightPositionRecord {
        fr24_id: Some(format!("{}-leg", registration.to_lowercase())),
        reg: Some(registration.to_string()),
        callsign: Some("TST100".to_string()),
        lat: Some(lat),
        lon: Some(lon),
        alt: Some(35000.0),
        gspeed: Some(440.0),
        ..Default::default()
    }
}

pub fn upstream_config(batch_size: usize) -> UpstreamConfig {
    UpstreamConfig {
        batch_size,
        min_request_interval_ms: 0,
        ..Default::default()
    }
}

/// Everything a cycle test needs, wired to in-memory fakes
pub struct Harness {
    pub runner: Arc<CycleRunner>,
    pub store: PollingScheduleStore,
    pub source: Arc<FakePositionSource>,
    pub samples: Arc<InMemorySamples>,
}

impl Harness {
    pub fn new(source: FakePositionSource, airports: InMemoryAirports, schedule: ScheduleConfig) -> Self {
        Self::with_upstream(source, airports, schedule, upstream_config(15))
    }

    pub fn with_upstream(
        source: FakePositionSource,
        airports: InMemoryAirports,
        schedule: ScheduleConfig,
        upstream: UpstreamConfig,
    ) -> Self {
        let store = PollingScheduleStore::new(Arc::new(MemoryScheduleBackend::new()), schedule);
        let samples = Arc::new(InMemorySamples::default());
        let source = Arc::new(source);
        let estimator = DistanceEstimator::new(
            samples.clone(),
            Arc::new(airports),
            DistanceConfig::default(),
        );
        let runner = Arc::new(CycleRunner::new(
            store.clone(),
            source.clone(),
            estimator,
            samples.clone(),
            upstream,
        ));
        Self {
            runner,
            store,
            source,
            samples,
        }
    }
}

/// Connection URL for a real backend, or `None` (with a skip marker) when unset
pub fn backend_url(var: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    let url = std::env::var(var).ok().filter(|url| !url.is_empty());
    if url.is_none() {
        let required = std::env::var("AEROTRACK_REQUIRE_BACKENDS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if required {
            panic!("{var} must be set when AEROTRACK_REQUIRE_BACKENDS is enabled");
        }
        eprintln!("SKIPPED: {var} not set");
    }
    url
}

/// `TEST_REDIS_URL`, if Redis-backed tests should run
pub fn test_redis_url() -> Option<String> {
    backend_url("TEST_REDIS_URL")
}

/// Isolated database created for one test and dropped with it.
///
/// `TEST_DATABASE_URL` points at any database on the server; a fresh
/// `aerotrack_test_<uuid>` database is created next to it and migrated.
pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    /// `None` when `TEST_DATABASE_URL` is not set
    pub async fn new() -> Result<Option<Self>> {
        let Some(base_url) = backend_url("TEST_DATABASE_URL") else {
            return Ok(None);
        };

        let (server, _) = base_url
            .rsplit_once('/')
            .context("TEST_DATABASE_URL must include a database name")?;
        let admin_url = format!("{}/postgres", server);
        let db_name = format!("aerotrack_test_{}", uuid::Uuid::new_v4().simple());
        let test_db_url = format!("{}/{}", server, db_name);

        let create_admin_url = admin_url.clone();
        let create_name = db_name.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&create_admin_url)
                .context("Failed to connect to PostgreSQL. Is PostgreSQL running?")?;
            // db_name is generated from a UUID, safe to interpolate
            diesel::sql_query(format!("CREATE DATABASE \"{}\"", create_name))
                .execute(&mut conn)
                .context("Failed to create test database")?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        let pool = aerotrack::database::create_pool(&test_db_url, 5)?;
        aerotrack::database::run_migrations(&pool).await?;

        Ok(Some(TestDatabase {
            db_name,
            pool,
            admin_url,
        }))
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn name(&self) -> &str {
        &self.db_name
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        // Needs PostgreSQL 13+ for WITH (FORCE)
        if let Ok(mut conn) = PgConnection::establish(&self.admin_url) {
            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.db_name);
            if let Err(e) = diesel::sql_query(drop_sql).execute(&mut conn) {
                eprintln!("Warning: failed to drop test database {}: {}", self.db_name, e);
            }
        }
    }
}
