use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ScheduleConfig;
use crate::polling_schedule::{EntityMeta, ScheduleBackend};

/// Remove and return due members in one server-side step so two callers can
/// never claim the same id. ZREM runs in chunks since Lua's `unpack` is
/// limited to a few thousand values.
const CLAIM_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local chunk = 1000
for i = 1, #due, chunk do
    redis.call('ZREM', KEYS[1], unpack(due, i, math.min(i + chunk - 1, #due)))
end
return due
"#;

/// Schedule backend on a Redis sorted set (`<prefix>:polling`, score = due time)
/// and a hash of JSON metadata (`<prefix>:meta`)
#[derive(Clone)]
pub struct RedisScheduleBackend {
    conn: ConnectionManager,
    polling_key: String,
    meta_key: String,
    claim_script: Script,
}

impl RedisScheduleBackend {
    pub async fn connect(redis_url: &str, config: &ScheduleConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!(
            polling_key = %config.polling_key(),
            meta_key = %config.meta_key(),
            "Connected polling schedule to Redis"
        );
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: &ScheduleConfig) -> Self {
        Self {
            conn,
            polling_key: config.polling_key(),
            meta_key: config.meta_key(),
            claim_script: Script::new(CLAIM_DUE_SCRIPT),
        }
    }

    fn decode_meta(&self, id: &str, raw: &str) -> Option<EntityMeta> {
        match serde_json::from_str(raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                // Treated as absent; the next outcome overwrites it
                warn!(entity = id, "Discarding unreadable schedule metadata: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ScheduleBackend for RedisScheduleBackend {
    async fn add_if_absent(&self, ids: &[String], due: i64, now: i64) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let unknown = serde_json::to_string(&EntityMeta::unknown(now))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZADD").arg(&self.polling_key).arg("NX");
        for id in ids {
            pipe.arg(due).arg(id);
        }
        for id in ids {
            pipe.cmd("HSETNX")
                .arg(&self.meta_key)
                .arg(id)
                .arg(&unknown)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let (added,): (usize,) = pipe
            .query_async(&mut conn)
            .await
            .context("Failed to bootstrap polling schedule")?;
        Ok(added)
    }

    async fn claim_due(&self, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = self
            .claim_script
            .key(&self.polling_key)
            .arg(now)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .context("Failed to claim due entities")?;
        Ok(claimed)
    }

    async fn set_due(&self, id: &str, due: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(&self.polling_key)
            .arg(due)
            .arg(id)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to reschedule {}", id))?;
        Ok(())
    }

    async fn get_meta(&self, id: &str) -> Result<Option<EntityMeta>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.meta_key)
            .arg(id)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to read metadata for {}", id))?;
        Ok(raw.and_then(|raw| self.decode_meta(id, &raw)))
    }

    async fn set_meta(&self, id: &str, meta: &EntityMeta) -> Result<()> {
        let encoded = serde_json::to_string(meta)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(&self.meta_key)
            .arg(id)
            .arg(encoded)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to write metadata for {}", id))?;
        Ok(())
    }

    async fn commit_outcome(
        &self,
        id: &str,
        due: i64,
        meta: &EntityMeta,
        ttl: Duration,
    ) -> Result<()> {
        let encoded = serde_json::to_string(meta)?;
        let ttl_secs = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&self.polling_key)
            .arg(due)
            .arg(id)
            .ignore()
            .cmd("HSET")
            .arg(&self.meta_key)
            .arg(id)
            .arg(encoded)
            .ignore()
            .cmd("EXPIRE")
            .arg(&self.polling_key)
            .arg(ttl_secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(&self.meta_key)
            .arg(ttl_secs)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to record poll outcome for {}", id))?;
        Ok(())
    }

    async fn refresh_expiry(&self, ttl: Duration) -> Result<()> {
        let ttl_secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("EXPIRE")
            .arg(&self.polling_key)
            .arg(ttl_secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(&self.meta_key)
            .arg(ttl_secs)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("Failed to refresh polling schedule expiry")?;
        Ok(())
    }

    async fn due_time(&self, id: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(&self.polling_key)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(score.map(|s| s as i64))
    }

    async fn scheduled_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("ZCARD")
            .arg(&self.polling_key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn next_due(&self) -> Result<Option<(String, i64)>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&self.polling_key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries.into_iter().next().map(|(id, score)| (id, score as i64)))
    }
}
