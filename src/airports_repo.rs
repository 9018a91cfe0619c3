use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use moka::future::Cache;
use std::time::Duration;
use tracing::debug;

use crate::database::PgPool;
use crate::distance::ReferencePoints;

/// Reference coordinates of an airport
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = crate::schema::airports)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AirportPoint {
    pub id: i32,
    pub name: String,
    pub iata: Option<String>,
    pub icao: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Clone)]
pub struct AirportsRepository {
    pool: PgPool,
}

impl AirportsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find an airport by IATA (3 letters) or ICAO (4 letters) code
    pub async fn get_airport_by_code(&self, code: &str) -> Result<Option<AirportPoint>> {
        use crate::schema::airports::dsl::*;

        let code = code.trim().to_uppercase();
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            // IATA match wins when a code collides across the two columns
            let by_iata: Option<AirportPoint> = airports
                .filter(iata.eq(&code))
                .order(id.asc())
                .select(AirportPoint::as_select())
                .first(&mut conn)
                .optional()?;
            if by_iata.is_some() {
                return Ok::<Option<AirportPoint>, anyhow::Error>(by_iata);
            }

            let by_icao: Option<AirportPoint> = airports
                .filter(icao.eq(&code))
                .order(id.asc())
                .select(AirportPoint::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<AirportPoint>, anyhow::Error>(by_icao)
        })
        .await??;

        Ok(result)
    }
}

/// Reference point lookup with an in-process cache.
/// Airport coordinates are static, so both hits and misses are cached.
#[derive(Clone)]
pub struct CachedReferencePoints {
    repo: AirportsRepository,
    cache: Cache<String, Option<(f64, f64)>>,
}

impl CachedReferencePoints {
    pub fn new(repo: AirportsRepository, ttl: Duration) -> Self {
        Self {
            repo,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl ReferencePoints for CachedReferencePoints {
    async fn coordinates(&self, code: &str) -> Result<Option<(f64, f64)>> {
        let key = code.trim().to_uppercase();
        if let Some(cached) = self.cache.get(&key).await {
            metrics::counter!("poller.airport_cache.hit").increment(1);
            return Ok(cached);
        }

        metrics::counter!("poller.airport_cache.miss").increment(1);
        // Errors are not cached so the next sample retries the lookup
        let point = self
            .repo
            .get_airport_by_code(&key)
            .await?
            .map(|airport| (airport.latitude, airport.longitude));
        debug!(code = %key, found = point.is_some(), "Airport lookup");

        self.cache.insert(key, point).await;
        Ok(point)
    }
}
