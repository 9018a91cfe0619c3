use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::debug;

use crate::cycle_runner::SampleSink;
use crate::database::PgPool;
use crate::distance::SampleHistory;
use crate::live_positions::LivePositionSample;

#[derive(Clone)]
pub struct LivePositionsRepository {
    pool: PgPool,
}

impl LivePositionsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a single sample
    pub async fn insert_sample(&self, sample: &LivePositionSample) -> Result<()> {
        use crate::schema::live_positions::dsl::*;

        let sample = sample.clone();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            diesel::insert_into(live_positions)
                .values(&sample)
                .execute(&mut conn)?;

            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// Most recent sample for a registration and flight leg created at or after `since`
    pub async fn find_latest_since(
        &self,
        reg: &str,
        flight: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LivePositionSample>> {
        use crate::schema::live_positions::dsl::*;

        let reg = reg.to_string();
        let flight = flight.map(str::to_string);
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let mut query = live_positions
                .filter(registration.eq(&reg))
                .filter(created_at.ge(since))
                .into_boxed();
            query = match &flight {
                Some(leg) => query.filter(flight_id.eq(leg)),
                None => query.filter(flight_id.is_null()),
            };

            let sample: Option<LivePositionSample> = query
                .order(created_at.desc())
                .select(LivePositionSample::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<LivePositionSample>, anyhow::Error>(sample)
        })
        .await??;

        Ok(result)
    }

    /// Count samples stored for a registration
    pub async fn count_for_registration(&self, reg: &str) -> Result<i64> {
        use crate::schema::live_positions::dsl::*;

        let reg = reg.to_string();
        let pool = self.pool.clone();
        let count = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let count: i64 = live_positions
                .filter(registration.eq(&reg))
                .count()
                .get_result(&mut conn)?;
            Ok::<i64, anyhow::Error>(count)
        })
        .await??;

        Ok(count)
    }
}

#[async_trait]
impl SampleHistory for LivePositionsRepository {
    async fn latest_prior_sample(
        &self,
        registration: &str,
        flight_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LivePositionSample>> {
        self.find_latest_since(registration, flight_id, since).await
    }
}

#[async_trait]
impl SampleSink for LivePositionsRepository {
    async fn persist(&self, sample: &LivePositionSample) -> Result<()> {
        self.insert_sample(sample).await?;
        debug!(
            registration = %sample.registration,
            sample_id = %sample.id,
            "Persisted live position sample"
        );
        Ok(())
    }
}
