use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Normalise a registration to the form used as schedule member and sample key
/// ("  ab-123 " -> "AB-123"). Returns None for blank input.
pub fn normalize_registration(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Accept RFC 3339 timestamps and treat anything else (null, empty, garbage) as absent
fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match DateTime::parse_from_rfc3339(value.trim()) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            debug!("Ignoring unparseable timestamp {:?}: {}", value, e);
            None
        }
    }))
}

/// One record of the upstream `live/flight-positions/full` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightPositionRecord {
    pub fr24_id: Option<String>,
    pub flight: Option<String>,
    pub callsign: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub track: Option<f64>,
    pub alt: Option<f64>,
    pub gspeed: Option<f64>,
    pub vspeed: Option<f64>,
    pub squawk: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub hex: Option<String>,
    #[serde(rename = "type")]
    pub aircraft_type: Option<String>,
    pub reg: Option<String>,
    pub painted_as: Option<String>,
    pub operating_as: Option<String>,
    pub orig_iata: Option<String>,
    pub orig_icao: Option<String>,
    pub dest_iata: Option<String>,
    pub dest_icao: Option<String>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub eta: Option<DateTime<Utc>>,
}

impl FlightPositionRecord {
    /// Registration this record belongs to, normalised
    pub fn registration(&self) -> Option<String> {
        self.reg.as_deref().and_then(normalize_registration)
    }

    /// Both coordinates, if the record carries a usable fix
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }

    /// Origin airport code to use for the reference point lookup (IATA preferred)
    pub fn origin_code(&self) -> Option<&str> {
        self.orig_iata
            .as_deref()
            .filter(|code| !code.trim().is_empty())
            .or_else(|| {
                self.orig_icao
                    .as_deref()
                    .filter(|code| !code.trim().is_empty())
            })
    }
}

/// A live position sample persisted for every upstream record
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::live_positions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct LivePositionSample {
    pub id: Uuid,
    pub registration: String,

    /// Upstream flight leg identifier (fr24_id); samples of the same leg share it
    pub flight_id: Option<String>,
    pub flight_number: Option<String>,
    pub callsign: Option<String>,
    pub hex: Option<String>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_ft: Option<f64>,
    pub ground_speed_kts: Option<f64>,
    pub vertical_speed_fpm: Option<f64>,
    pub track_deg: Option<i32>,
    pub squawk: Option<String>,
    pub source: Option<String>,

    pub aircraft_type: Option<String>,
    pub painted_as: Option<String>,
    pub operating_as: Option<String>,

    pub orig_iata: Option<String>,
    pub orig_icao: Option<String>,
    pub dest_iata: Option<String>,
    pub dest_icao: Option<String>,

    /// Observation time reported by the upstream
    pub observed_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,

    /// Movement since the last known fix, see `distance::DistanceEstimator`
    pub distance_km: f64,

    pub created_at: DateTime<Utc>,
}

impl LivePositionSample {
    /// Build the persisted sample from an upstream record and its estimated distance
    pub fn from_record(
        registration: String,
        record: FlightPositionRecord,
        distance_km: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            registration,
            flight_id: record.fr24_id,
            flight_number: record.flight,
            callsign: record.callsign,
            hex: record.hex,
            latitude: record.lat,
            longitude: record.lon,
            altitude_ft: record.alt,
            ground_speed_kts: record.gspeed,
            vertical_speed_fpm: record.vspeed,
            track_deg: record.track.filter(|t| t.is_finite()).map(|t| t.round() as i32),
            squawk: record.squawk,
            source: record.source,
            aircraft_type: record.aircraft_type,
            painted_as: record.painted_as,
            operating_as: record.operating_as,
            orig_iata: record.orig_iata,
            orig_icao: record.orig_icao,
            dest_iata: record.dest_iata,
            dest_icao: record.dest_icao,
            observed_at: record.timestamp,
            eta: record.eta,
            distance_km,
            created_at,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}
