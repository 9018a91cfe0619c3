use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::PgPool;
use crate::live_positions::normalize_registration;

/// Source of the registrations that should currently be tracked
#[async_trait]
pub trait FleetRegistry: Send + Sync {
    async fn active_registrations(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::registrations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RegistrationModel {
    pub registration: String,
    pub msn: Option<String>,
    pub aircraft_type: Option<String>,
    pub status: Option<String>,
    pub in_dashboard: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RegistrationsRepository {
    pool: PgPool,
}

impl RegistrationsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Registrations flagged for tracking, normalised and de-duplicated
    pub async fn get_tracked_registrations(&self) -> Result<Vec<String>> {
        use crate::schema::registrations::dsl::*;

        let pool = self.pool.clone();
        let regs = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let regs: Vec<String> = registrations
                .filter(in_dashboard.eq(true))
                .select(registration)
                .order(registration.asc())
                .load(&mut conn)?;
            Ok::<Vec<String>, anyhow::Error>(regs)
        })
        .await??;

        let mut normalized: Vec<String> = regs
            .iter()
            .filter_map(|reg| normalize_registration(reg))
            .collect();
        normalized.sort();
        normalized.dedup();
        Ok(normalized)
    }
}

#[async_trait]
impl FleetRegistry for RegistrationsRepository {
    async fn active_registrations(&self) -> Result<Vec<String>> {
        self.get_tracked_registrations().await
    }
}
