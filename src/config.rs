use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Polling schedule tuning (Redis keys, re-check intervals, sliding expiry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Prefix for the sorted-set and hash keys, e.g. "flights" -> "flights:polling"
    pub key_prefix: String,
    /// Re-check interval after the upstream returned a live record
    pub interval_found_secs: u64,
    /// Re-check interval after the upstream returned nothing
    pub interval_missed_secs: u64,
    /// Sliding expiry applied to both the schedule and the metadata keys
    pub ttl_secs: u64,
    /// Maximum number of entities claimed per cycle
    pub due_limit: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            key_prefix: "flights".to_string(),
            interval_found_secs: 15 * 60,
            interval_missed_secs: 30 * 60,
            ttl_secs: 2 * 60 * 60,
            due_limit: 150,
        }
    }
}

impl ScheduleConfig {
    pub fn interval_found(&self) -> Duration {
        Duration::from_secs(self.interval_found_secs)
    }

    pub fn interval_missed(&self) -> Duration {
        Duration::from_secs(self.interval_missed_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn polling_key(&self) -> String {
        format!("{}:polling", self.key_prefix)
    }

    pub fn meta_key(&self) -> String {
        format!("{}:meta", self.key_prefix)
    }
}

/// Upstream live positions API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Bearer token; normally supplied through FR24_API_KEY rather than the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Maximum registrations per request
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    /// Minimum gap between sequential requests (90 requests per minute by default)
    pub min_request_interval_ms: u64,
    /// Batches in flight at once; 1 means sequential with `min_request_interval_ms` pacing
    pub max_concurrent_batches: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fr24api.flightradar24.com/api".to_string(),
            api_key: None,
            batch_size: 15,
            request_timeout_secs: 30,
            min_request_interval_ms: 60_000 / 90,
            max_concurrent_batches: 1,
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

/// Distance estimator cascade settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    /// How far back to look for a prior sample of the same flight
    pub lookback_secs: u64,
    /// Ground speed below which an aircraft with no other evidence is treated as stationary
    pub min_airborne_ground_speed: f64,
    /// Multiplier turning ground speed into a short-interval distance in km
    pub speed_extrapolation_factor: f64,
    /// Airport coordinate cache lifetime
    pub reference_cache_ttl_secs: u64,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 70 * 60,
            min_airborne_ground_speed: 120.0,
            speed_extrapolation_factor: 1.825 / 5.0,
            reference_cache_ttl_secs: 6 * 60 * 60,
        }
    }
}

impl DistanceConfig {
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }

    pub fn reference_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reference_cache_ttl_secs)
    }
}

/// Cadence of the external trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub cycle_interval_secs: u64,
    /// How often the fleet registry is re-read and bootstrapped into the schedule
    pub fleet_sync_interval_secs: u64,
    pub metrics_port: u16,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            fleet_sync_interval_secs: 60,
            metrics_port: 9093,
        }
    }
}

impl TriggerConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn fleet_sync_interval(&self) -> Duration {
        Duration::from_secs(self.fleet_sync_interval_secs)
    }
}

/// Top-level poller configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    pub schedule: ScheduleConfig,
    pub upstream: UpstreamConfig,
    pub distance: DistanceConfig,
    pub trigger: TriggerConfig,
}

impl PollerConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: PollerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load from the resolved config path (defaults when the file does not exist),
    /// apply environment overrides and validate
    pub fn load_from_env() -> Result<Self> {
        let path = config_path();
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            Self::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay secrets and endpoints from the environment on top of the file values
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(key) = lookup("FR24_API_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Some(url) = lookup("FR24_API_URL") {
            self.upstream.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.schedule.key_prefix.trim().is_empty() {
            bail!("schedule.key_prefix must not be empty");
        }
        if self.schedule.interval_found_secs == 0 {
            bail!("schedule.interval_found_secs must be greater than zero");
        }
        if self.schedule.interval_missed_secs <= self.schedule.interval_found_secs {
            bail!(
                "schedule.interval_missed_secs ({}) must be greater than schedule.interval_found_secs ({})",
                self.schedule.interval_missed_secs,
                self.schedule.interval_found_secs
            );
        }
        if self.schedule.ttl_secs == 0 {
            bail!("schedule.ttl_secs must be greater than zero");
        }
        if self.schedule.due_limit == 0 {
            bail!("schedule.due_limit must be greater than zero");
        }
        if self.upstream.batch_size == 0 {
            bail!("upstream.batch_size must be greater than zero");
        }
        if self.upstream.max_concurrent_batches == 0 {
            bail!("upstream.max_concurrent_batches must be greater than zero");
        }
        if self.upstream.request_timeout_secs == 0 {
            bail!("upstream.request_timeout_secs must be greater than zero");
        }
        if self.trigger.cycle_interval_secs == 0 {
            bail!("trigger.cycle_interval_secs must be greater than zero");
        }
        if !(self.distance.speed_extrapolation_factor.is_finite()
            && self.distance.speed_extrapolation_factor >= 0.0)
        {
            bail!("distance.speed_extrapolation_factor must be a non-negative number");
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set (environment or database_url in config)")
    }

    pub fn require_redis_url(&self) -> Result<&str> {
        self.redis_url
            .as_deref()
            .context("REDIS_URL must be set (environment or redis_url in config)")
    }
}

/// Resolve the poller config file path.
///
/// Priority:
/// 1. `AEROTRACK_CONFIG` env var
/// 2. `/etc/aerotrack/poller.toml` (production/staging)
/// 3. `./aerotrack.toml` (development)
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AEROTRACK_CONFIG") {
        return PathBuf::from(path);
    }

    match std::env::var("AEROTRACK_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/etc/aerotrack/poller.toml"),
        _ => PathBuf::from("./aerotrack.toml"),
    }
}
