//! Distance-since-last-fix estimation for freshly fetched samples.
//!
//! The estimator walks a fallback cascade and stops at the first tier that applies:
//!
//! 1. no coordinates on the new record: 0 km
//! 2. a prior sample of the same flight inside the look-back window: great-circle distance
//! 3. a resolvable origin airport: great-circle distance from the airport
//! 4. ground speed at or above the airborne threshold: speed extrapolation, else 0 km
//!
//! Lookup failures are logged and treated as "not found" so the sample is always saved.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DistanceConfig;
use crate::geometry::haversine_distance_km;
use crate::live_positions::{FlightPositionRecord, LivePositionSample};

/// Read access to previously persisted samples
#[async_trait]
pub trait SampleHistory: Send + Sync {
    /// Most recent sample for `registration` and `flight_id` created at or after `since`.
    /// A `None` flight id matches samples that were stored without one.
    async fn latest_prior_sample(
        &self,
        registration: &str,
        flight_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LivePositionSample>>;
}

/// Airport code -> (latitude, longitude)
#[async_trait]
pub trait ReferencePoints: Send + Sync {
    async fn coordinates(&self, code: &str) -> Result<Option<(f64, f64)>>;
}

/// Which cascade tier produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceTier {
    NoPosition,
    PriorSample,
    OriginAirport,
    GroundSpeed,
    Stationary,
}

impl DistanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceTier::NoPosition => "no_position",
            DistanceTier::PriorSample => "prior_sample",
            DistanceTier::OriginAirport => "origin_airport",
            DistanceTier::GroundSpeed => "ground_speed",
            DistanceTier::Stationary => "stationary",
        }
    }
}

impl fmt::Display for DistanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimate {
    pub distance_km: f64,
    pub tier: DistanceTier,
}

impl DistanceEstimate {
    fn new(distance_km: f64, tier: DistanceTier) -> Self {
        // Never hand a NaN or negative value to persistence
        let distance_km = if distance_km.is_finite() && distance_km > 0.0 {
            distance_km
        } else {
            0.0
        };
        Self { distance_km, tier }
    }
}

#[derive(Clone)]
pub struct DistanceEstimator {
    history: Arc<dyn SampleHistory>,
    reference_points: Arc<dyn ReferencePoints>,
    config: DistanceConfig,
}

impl DistanceEstimator {
    pub fn new(
        history: Arc<dyn SampleHistory>,
        reference_points: Arc<dyn ReferencePoints>,
        config: DistanceConfig,
    ) -> Self {
        Self {
            history,
            reference_points,
            config,
        }
    }

    /// Estimate movement since the last known fix for a record observed at `now`
    pub async fn estimate(
        &self,
        registration: &str,
        record: &FlightPositionRecord,
        now: DateTime<Utc>,
    ) -> DistanceEstimate {
        let estimate = self.run_cascade(registration, record, now).await;
        metrics::counter!("poller.distance.tier", "tier" => estimate.tier.as_str()).increment(1);
        debug!(
            registration,
            tier = %estimate.tier,
            distance_km = estimate.distance_km,
            "Estimated distance"
        );
        estimate
    }

    async fn run_cascade(
        &self,
        registration: &str,
        record: &FlightPositionRecord,
        now: DateTime<Utc>,
    ) -> DistanceEstimate {
        let Some((lat, lon)) = record.coordinates() else {
            return DistanceEstimate::new(0.0, DistanceTier::NoPosition);
        };

        if let Some((prev_lat, prev_lon)) = self.prior_fix(registration, record, now).await {
            return DistanceEstimate::new(
                haversine_distance_km(prev_lat, prev_lon, lat, lon),
                DistanceTier::PriorSample,
            );
        }

        if let Some(code) = record.origin_code() {
            match self.reference_points.coordinates(code).await {
                Ok(Some((airport_lat, airport_lon))) => {
                    return DistanceEstimate::new(
                        haversine_distance_km(airport_lat, airport_lon, lat, lon),
                        DistanceTier::OriginAirport,
                    );
                }
                Ok(None) => {
                    debug!(registration, code, "Origin airport not found, falling back");
                }
                Err(e) => {
                    warn!(
                        registration,
                        code, "Origin airport lookup failed, falling back: {:#}", e
                    );
                }
            }
        }

        match record.gspeed {
            Some(speed) if speed.is_finite() && speed >= self.config.min_airborne_ground_speed => {
                DistanceEstimate::new(
                    speed * self.config.speed_extrapolation_factor,
                    DistanceTier::GroundSpeed,
                )
            }
            _ => DistanceEstimate::new(0.0, DistanceTier::Stationary),
        }
    }

    /// Coordinates of the most recent usable prior sample of the same flight
    async fn prior_fix(
        &self,
        registration: &str,
        record: &FlightPositionRecord,
        now: DateTime<Utc>,
    ) -> Option<(f64, f64)> {
        let lookback = match chrono::Duration::from_std(self.config.lookback()) {
            Ok(lookback) => lookback,
            Err(e) => {
                warn!("Invalid look-back window, skipping prior sample lookup: {}", e);
                return None;
            }
        };
        let since = now - lookback;

        match self
            .history
            .latest_prior_sample(registration, record.fr24_id.as_deref(), since)
            .await
        {
            Ok(Some(prior)) => {
                let fix = prior.coordinates();
                if fix.is_none() {
                    debug!(
                        registration,
                        sample_id = %prior.id,
                        "Prior sample has no coordinates, falling back"
                    );
                }
                fix
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    registration,
                    "Prior sample lookup failed, falling back: {:#}", e
                );
                None
            }
        }
    }
}
