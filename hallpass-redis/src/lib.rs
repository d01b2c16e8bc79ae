//! Redis stores for `hallpass` (companion crate).
//!
//! Window counters live in sorted sets scored by event time and updated by one Lua script, so
//! concurrent instances never admit past the limit. Violation records are JSON strings with a
//! native Redis TTL, replaced by compare-and-set so concurrent updates never lose a violation.
//!
//! ```no_run
//! # async fn run() -> Result<(), hallpass_redis::ConnectError> {
//! let config = hallpass::HallpassConfig::from_env()?;
//! let engine = hallpass_redis::engine_from_config(&config).await?;
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use hallpass::config::DEFAULT_KEY_PREFIX;
use hallpass::{
    ConfigError, EngineBuilder, HallpassConfig, RateLimitEngine, StoreConfig, StoreError,
    Transform, ViolationStore, WindowOutcome, WindowStore,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// Purge, count, conditionally record, refresh expiry and report the oldest score.
///
/// KEYS[1] window key; ARGV now_ms, window_ms, limit, member.
/// Returns `{admitted, count, oldest_or_-1}`.
const ADMIT_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  admitted = 1
end
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {admitted, count, oldest_score}
";

/// Replace a violation record only if it still holds the value the update was computed from.
///
/// KEYS[1] record key; ARGV had_value (`0`/`1`), expected, payload, ttl_secs.
/// Returns 1 when written, 0 on conflict.
const SWAP_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
return 1
";

/// Attempts before an update gives up on a hot record.
const MAX_SWAP_ATTEMPTS: usize = 8;

/// Errors raised while wiring an engine to Redis.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot connect to redis: {0}")]
    Redis(#[from] redis::RedisError),
}

fn store_error(error: redis::RedisError) -> StoreError {
    if error.kind() == redis::ErrorKind::TypeError {
        StoreError::Corrupt(error.to_string())
    } else {
        StoreError::Unavailable(error.to_string())
    }
}

/// Open a managed connection to `url`. The manager reconnects on its own after failures.
pub async fn connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;
    tracing::info!(target: "hallpass::redis", "connected to redis");
    Ok(manager)
}

/// Build an engine for `config`: Redis-backed when the store is remote, in-process otherwise.
pub async fn engine_from_config(config: &HallpassConfig) -> Result<RateLimitEngine, ConnectError> {
    let builder = EngineBuilder::from_config(config)?;
    match &config.store {
        StoreConfig::Local => Ok(builder.build()),
        StoreConfig::Remote { url, key_prefix } => {
            let conn = connect(url).await?;
            Ok(builder
                .window_store(RedisWindowStore::new(conn.clone(), key_prefix))
                .violation_store(RedisViolationStore::new(conn, key_prefix))
                .build())
        }
    }
}

/// Sliding-window store shared by every instance pointing at the same Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    prefix: String,
    script: Script,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("prefix", &self.prefix)
            .field("conn", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisWindowStore {
    /// Keys are `{key_prefix}window:{class}:{role}:{principal}`.
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            prefix: format!("{}window:", key_prefix),
            script: Script::new(ADMIT_SCRIPT),
        }
    }

    /// Store under the default `hallpass:` namespace.
    pub fn with_default_prefix(conn: ConnectionManager) -> Self {
        Self::new(conn, DEFAULT_KEY_PREFIX)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn admit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_millis: u64,
    ) -> Result<WindowOutcome, StoreError> {
        let redis_key = self.key(key);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let member = format!("{}-{}", now_millis, uuid::Uuid::new_v4());
        let mut conn = self.conn.clone();
        let (admitted, count, oldest): (i64, i64, i64) = self
            .script
            .key(&redis_key)
            .arg(now_millis)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        tracing::trace!(target: "hallpass::redis", key = %redis_key, admitted, count, "window admit");
        Ok(WindowOutcome {
            admitted: admitted == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest_in_window: u64::try_from(oldest).ok(),
        })
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(key)).await.map_err(store_error)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Violation records as JSON strings under `{key_prefix}violations:{principal}`.
#[derive(Clone)]
pub struct RedisViolationStore {
    conn: ConnectionManager,
    prefix: String,
    swap: Script,
}

impl std::fmt::Debug for RedisViolationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisViolationStore")
            .field("prefix", &self.prefix)
            .field("conn", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisViolationStore {
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self { conn, prefix: format!("{}violations:", key_prefix), swap: Script::new(SWAP_SCRIPT) }
    }

    pub fn with_default_prefix(conn: ConnectionManager) -> Self {
        Self::new(conn, DEFAULT_KEY_PREFIX)
    }

    fn key(&self, principal: &str) -> String {
        format!("{}{}", self.prefix, principal)
    }
}

/// Whole seconds for `SET EX`, rounded up so a record never expires early.
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl ViolationStore for RedisViolationStore {
    async fn load(&self, principal: &str, _now_millis: u64) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(self.key(principal)).await.map_err(store_error)
    }

    async fn update(
        &self,
        principal: &str,
        _now_millis: u64,
        apply: &Transform<'_>,
    ) -> Result<Option<String>, StoreError> {
        let key = self.key(principal);
        let mut conn = self.conn.clone();
        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let current: Option<String> = conn.get(&key).await.map_err(store_error)?;
            let Some((payload, ttl)) = apply(current.as_deref()) else {
                return Ok(current);
            };
            let swapped: i64 = self
                .swap
                .key(&key)
                .arg(u8::from(current.is_some()))
                .arg(current.as_deref().unwrap_or(""))
                .arg(&payload)
                .arg(ttl_secs(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(store_error)?;
            if swapped == 1 {
                return Ok(Some(payload));
            }
            tracing::trace!(
                target: "hallpass::redis",
                key = %key,
                attempt,
                "violation record changed underneath; retrying"
            );
        }
        Err(StoreError::Conflict(key))
    }

    async fn remove(&self, principal: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(principal)).await.map_err(store_error)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
