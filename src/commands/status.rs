use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde::Serialize;

use aerotrack::config::PollerConfig;
use aerotrack::live_positions::normalize_registration;
use aerotrack::polling_schedule::EntityMeta;

#[derive(Debug, Serialize)]
struct NextDue {
    registration: String,
    due_at: String,
    meta: Option<EntityMeta>,
}

#[derive(Debug, Serialize)]
struct EntityStatus {
    registration: String,
    due_at: Option<String>,
    meta: Option<EntityMeta>,
}

#[derive(Debug, Serialize)]
struct StatusInfo {
    version: &'static str,
    git_commit: &'static str,
    build_timestamp: &'static str,
    target: &'static str,
    polling_key: String,
    scheduled: usize,
    next_due: Option<NextDue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<EntityStatus>,
}

fn format_due(due: i64) -> String {
    Utc.timestamp_opt(due, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| due.to_string())
}

/// Print build info and the state of the polling schedule as JSON
pub async fn handle_status(config: PollerConfig, registration: Option<String>) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "status");
    });

    let store = super::build_schedule_store(&config, false).await?;
    let scheduled = store.scheduled_count().await?;

    let next_due = match store.next_due().await? {
        Some((registration, due)) => {
            let meta = store.meta(&registration).await?;
            Some(NextDue {
                registration,
                due_at: format_due(due),
                meta,
            })
        }
        None => None,
    };

    let entity = match registration.as_deref().and_then(normalize_registration) {
        Some(registration) => Some(EntityStatus {
            due_at: store.due_time(&registration).await?.map(format_due),
            meta: store.meta(&registration).await?,
            registration,
        }),
        None => None,
    };

    let status = StatusInfo {
        version: env!("VERGEN_GIT_DESCRIBE"),
        git_commit: env!("VERGEN_GIT_SHA"),
        build_timestamp: env!("VERGEN_BUILD_TIMESTAMP"),
        target: env!("VERGEN_CARGO_TARGET_TRIPLE"),
        polling_key: config.schedule.polling_key(),
        scheduled,
        next_due,
        entity,
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
