//! aerotrack - adaptive live position poller
//!
//! Polls a rate-limited live positions API for a fleet of tracked aircraft.
//! A durable schedule decides when each registration is next checked: aircraft
//! that were seen come back sooner than aircraft that were not. Every fetched
//! record is enriched with the distance travelled since its last known fix and
//! stored for later cycles.

pub mod airports_repo;
pub mod config;
pub mod cycle_runner;
pub mod database;
pub mod distance;
pub mod geometry;
pub mod live_positions;
pub mod live_positions_repo;
pub mod log_format;
pub mod metrics;
pub mod polling_schedule;
pub mod polling_schedule_redis;
pub mod registrations_repo;
pub mod schema;
pub mod trigger;
pub mod upstream_client;

pub use config::PollerConfig;
pub use cycle_runner::{CycleRunner, CycleSummary};
pub use polling_schedule::{EntityMeta, EntityState, PollingScheduleStore};
