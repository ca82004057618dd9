//! Redis backend.
//!
//! Bucket state is a hash per key (`tokens`, `max_tokens`, `refill_interval`
//! in milliseconds, `last_refill` as unix milliseconds). The read, refill,
//! compare and write for a take happen inside one Lua script, so concurrent
//! clients on separate connections can never both spend the same tokens.

use crate::backend::{validate_key, validate_limit, validate_tokens, Backend, TokenInfo};
use crate::config::Config;
use crate::context::Context;
use crate::error::{Result, ThrottleError};
use crate::token_bucket::TokenBucket;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local requested = tonumber(ARGV[1])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'max_tokens', 'refill_interval', 'last_refill')
local max_tokens = tonumber(state[2]) or tonumber(ARGV[2])
local refill = tonumber(state[3]) or tonumber(ARGV[3])
local tokens = tonumber(state[1]) or max_tokens
local last_refill = tonumber(state[4]) or now
if tokens > max_tokens then
    tokens = max_tokens
end

local refilled = false
local elapsed = now - last_refill
if elapsed >= refill then
    tokens = math.min(max_tokens, tokens + math.floor(elapsed / refill))
    last_refill = now
    refilled = true
end

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

if allowed == 1 or refilled then
    redis.call('HSET', key,
        'tokens', tokens,
        'max_tokens', max_tokens,
        'refill_interval', refill,
        'last_refill', last_refill)
    redis.call('EXPIRE', key, ttl)
end

return {allowed, tokens}
"#;

const INFO_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[3])

local exists = redis.call('EXISTS', key)
local state = redis.call('HMGET', key, 'tokens', 'max_tokens', 'refill_interval', 'last_refill')
local max_tokens = tonumber(state[2]) or tonumber(ARGV[1])
local refill = tonumber(state[3]) or tonumber(ARGV[2])
local tokens = tonumber(state[1]) or max_tokens
local last_refill = tonumber(state[4]) or now
if tokens > max_tokens then
    tokens = max_tokens
end

if exists == 1 then
    local elapsed = now - last_refill
    if elapsed >= refill then
        tokens = math.min(max_tokens, tokens + math.floor(elapsed / refill))
        last_refill = now
        redis.call('HSET', key, 'tokens', tokens, 'last_refill', last_refill)
    end
end

return {exists, tokens, max_tokens, refill, last_refill}
"#;

pub struct RedisBackend {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: Config,
    closed: AtomicBool,
    take_script: Script,
    info_script: Script,
}

impl RedisBackend {
    /// Connects to `config.redis.url` and verifies the server answers `PING`.
    pub async fn new(config: Config) -> Result<Self> {
        let config = config
            .validated()
            .map_err(|e| e.context("invalid options"))?;
        validate_redis_url(&config.redis.url)?;

        let connect_timeout = config.redis.connect_timeout;
        if connect_timeout.is_zero() {
            return Err(ThrottleError::validation(
                "connect_timeout",
                format!("{:?}", connect_timeout),
                "connect_timeout must be positive",
            ));
        }

        let client = Client::open(config.redis.url.as_str())
            .map_err(|e| ThrottleError::backend("failed to parse Redis URL", e))?;

        let connect = async {
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| ThrottleError::backend("failed to connect to Redis", e))?;
            ping(&mut conn).await?;
            Ok::<_, ThrottleError>(conn)
        };

        let conn = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ThrottleError::Timeout {
                    timeout: connect_timeout,
                }
                .context("failed to connect to Redis"))
            }
        };

        info!(
            target: "tollgate::redis",
            key_prefix = %config.redis.key_prefix,
            default_limit = config.default_limit,
            default_refill = ?config.default_refill,
            "Connected to Redis"
        );

        Ok(Self {
            client,
            connection: RwLock::new(Some(conn)),
            config,
            closed: AtomicBool::new(false),
            take_script: Script::new(TAKE_SCRIPT),
            info_script: Script::new(INFO_SCRIPT),
        })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.redis.key_prefix, key)
    }

    fn ttl_secs(&self) -> u64 {
        self.config.idle_ttl().as_secs().max(1)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ThrottleError::Unavailable("backend is closed".to_string()));
        }
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.ensure_open()?;
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| ThrottleError::Unavailable("no Redis connection available".to_string()))
    }

    fn defaults(&self) -> (i64, u64) {
        (self.config.default_limit, duration_ms(self.config.default_refill))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn take(&self, ctx: &Context, key: &str, tokens: i64) -> Result<bool> {
        self.ensure_open()?;
        validate_key(key)?;
        validate_tokens(tokens)?;
        ctx.err()?;

        let mut conn = self.connection().await?;
        let (default_limit, default_refill_ms) = self.defaults();
        let mut invocation = self.take_script.prepare_invoke();
        invocation
            .key(self.storage_key(key))
            .arg(tokens)
            .arg(default_limit)
            .arg(default_refill_ms)
            .arg(Utc::now().timestamp_millis())
            .arg(self.ttl_secs());

        let (allowed, remaining): (i64, i64) = ctx
            .run(async {
                invocation.invoke_async(&mut conn).await.map_err(|e| {
                    warn!(target: "tollgate::redis", key, error = %e, "Take script failed");
                    ThrottleError::backend("failed to execute take script", e)
                })
            })
            .await?;

        let allowed = allowed == 1;
        debug!(target: "tollgate::redis", key, tokens, remaining, allowed, "take");
        Ok(allowed)
    }

    async fn reset(&self, ctx: &Context, key: &str) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        ctx.err()?;

        let mut conn = self.connection().await?;
        let storage_key = self.storage_key(key);
        ctx.run(async {
            redis::cmd("DEL")
                .arg(&storage_key)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|e| ThrottleError::backend("failed to delete Redis key", e))
        })
        .await?;

        debug!(target: "tollgate::redis", key, "reset");
        Ok(())
    }

    async fn get_info(&self, ctx: &Context, key: &str) -> Result<TokenInfo> {
        self.ensure_open()?;
        validate_key(key)?;
        ctx.err()?;

        let mut conn = self.connection().await?;
        let (default_limit, default_refill_ms) = self.defaults();
        let now = Utc::now();
        let mut invocation = self.info_script.prepare_invoke();
        invocation
            .key(self.storage_key(key))
            .arg(default_limit)
            .arg(default_refill_ms)
            .arg(now.timestamp_millis());

        let (exists, tokens, max_tokens, refill_ms, last_refill_ms): (i64, i64, i64, i64, i64) = ctx
            .run(async {
                invocation
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| ThrottleError::backend("failed to get bucket info from Redis", e))
            })
            .await?;

        if exists == 0 {
            let bucket = TokenBucket::new(self.config.default_limit, self.config.default_refill, now);
            return Ok(bucket.snapshot(key));
        }

        let last_refill = DateTime::from_timestamp_millis(last_refill_ms).unwrap_or(now);
        let refill = Duration::from_millis(u64::try_from(refill_ms).unwrap_or(1).max(1));
        Ok(TokenBucket::from_parts(tokens, max_tokens, refill, last_refill).snapshot(key))
    }

    async fn set_limit(&self, ctx: &Context, key: &str, limit: i64, refill: Duration) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        validate_limit(limit, refill)?;
        ctx.err()?;

        let mut conn = self.connection().await?;
        let storage_key = self.storage_key(key);
        let ttl = self.ttl_secs();
        // A fresh key starts from the default bucket, as the in-memory backend does.
        let seed_tokens = self.config.default_limit.min(limit);
        let now_ms = Utc::now().timestamp_millis();
        ctx.run(async {
            redis::pipe()
                .atomic()
                .cmd("HSETNX")
                .arg(&storage_key)
                .arg("tokens")
                .arg(seed_tokens)
                .ignore()
                .cmd("HSETNX")
                .arg(&storage_key)
                .arg("last_refill")
                .arg(now_ms)
                .ignore()
                .cmd("HSET")
                .arg(&storage_key)
                .arg("max_tokens")
                .arg(limit)
                .arg("refill_interval")
                .arg(duration_ms(refill))
                .ignore()
                .cmd("EXPIRE")
                .arg(&storage_key)
                .arg(ttl)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| ThrottleError::backend("failed to set bucket limits in Redis", e))
        })
        .await?;

        debug!(target: "tollgate::redis", key, limit, refill = ?refill, "set_limit");
        Ok(())
    }

    async fn close(&self, _ctx: &Context) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the last handle closes the multiplexed connection.
        self.connection.write().await.take();
        info!(target: "tollgate::redis", "Redis backend closed");
        Ok(())
    }

    async fn health_check(&self, ctx: &Context) -> Result<()> {
        self.ensure_open()?;
        ctx.err()?;

        let mut conn = self.connection().await?;
        ctx.run(async { ping(&mut conn).await })
            .await
            .map_err(|e| e.context("Redis health check failed"))
    }
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection", &self.client.get_connection_info().addr)
            .field("key_prefix", &self.config.redis.key_prefix)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

async fn ping(conn: &mut MultiplexedConnection) -> Result<()> {
    redis::cmd("PING")
        .query_async::<_, String>(conn)
        .await
        .map(|_| ())
        .map_err(|e| ThrottleError::backend("Ping failed", e))
}

/// Milliseconds in `d`, at least one so scripts never divide by zero.
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Validates a Redis URL
pub fn validate_redis_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(ThrottleError::validation(
            "redis_url",
            "\"\"",
            "Redis URL cannot be empty",
        ));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(ThrottleError::validation(
            "redis_url",
            url,
            "Redis URL must start with 'redis://' or 'rediss://'",
        ));
    }

    Ok(())
}
