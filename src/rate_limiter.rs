use crate::backend::{validate_key, validate_limit, Backend, TokenInfo};
use crate::config::Config;
use crate::context::Context;
use crate::error::{Result, ThrottleError};
use crate::in_memory::InMemoryBackend;
use crate::redis_backend::RedisBackend;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Interval between availability checks in [`RateLimiter::wait`]
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Rate limiter facade over a [`Backend`].
///
/// Validates every request before it reaches the backend and tracks whether the
/// limiter has been closed. Once closed, every operation except [`RateLimiter::close`]
/// fails with [`ThrottleError::Unavailable`].
pub struct RateLimiter {
    backend: Arc<dyn Backend>,
    config: Config,
    closed: RwLock<bool>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn Backend>, config: Config) -> Result<Self> {
        let config = config
            .validated()
            .map_err(|e| e.context("invalid configuration"))?;

        Ok(Self {
            backend,
            config,
            closed: RwLock::new(false),
        })
    }

    /// Limiter backed by a process-local [`InMemoryBackend`].
    pub fn in_memory(config: Config) -> Result<Self> {
        let backend = InMemoryBackend::new(config.clone())?;
        Self::new(Arc::new(backend), config)
    }

    /// Limiter backed by a [`RedisBackend`] at `config.redis.url`.
    pub async fn redis(config: Config) -> Result<Self> {
        let backend = RedisBackend::new(config.clone()).await?;
        Self::new(Arc::new(backend), config)
    }

    /// Consumes `tokens` for `key`. Returns `false` when the bucket cannot cover the request.
    pub async fn take(&self, ctx: &Context, key: &str, tokens: i64) -> Result<bool> {
        let closed = self.closed.read().await;
        self.ensure_open(*closed)?;
        validate_key(key)?;
        self.validate_tokens(tokens)?;
        ctx.err()?;

        self.backend
            .take(ctx, key, tokens)
            .await
            .map_err(|e| e.context("failed to take tokens from backend"))
    }

    /// Installs a per-key limit, then takes tokens under it.
    ///
    /// The two backend calls are not atomic as a pair: if the take does not
    /// complete, the custom limit stays applied.
    pub async fn take_with_limit(
        &self,
        ctx: &Context,
        key: &str,
        tokens: i64,
        limit: i64,
        refill: Duration,
    ) -> Result<bool> {
        let closed = self.closed.read().await;
        self.ensure_open(*closed)?;
        validate_key(key)?;
        self.validate_tokens(tokens)?;
        validate_limit(limit, refill)?;
        ctx.err()?;

        self.backend
            .set_limit(ctx, key, limit, refill)
            .await
            .map_err(|e| e.context("failed to set custom limit"))?;

        self.backend
            .take(ctx, key, tokens)
            .await
            .map_err(|e| e.context("failed to take tokens from backend"))
    }

    /// Like [`RateLimiter::take`], but reports an exhausted bucket as
    /// [`ThrottleError::RateLimitExceeded`].
    pub async fn acquire(&self, ctx: &Context, key: &str, tokens: i64) -> Result<()> {
        if self.take(ctx, key, tokens).await? {
            return Ok(());
        }

        let info = self.get_info(ctx, key).await?;
        debug!(target: "tollgate::limiter", key, tokens, available = info.tokens, "Rate limit exceeded");
        Err(ThrottleError::RateLimitExceeded {
            key: key.to_string(),
            limit: info.max_tokens,
            reset: info.reset_time,
        })
    }

    pub async fn reset(&self, ctx: &Context, key: &str) -> Result<()> {
        let closed = self.closed.read().await;
        self.ensure_open(*closed)?;
        validate_key(key)?;
        ctx.err()?;

        self.backend
            .reset(ctx, key)
            .await
            .map_err(|e| e.context("failed to reset key"))
    }

    /// Snapshot of the bucket for `key`. Commits any pending refill but never consumes.
    pub async fn get_info(&self, ctx: &Context, key: &str) -> Result<TokenInfo> {
        let closed = self.closed.read().await;
        self.ensure_open(*closed)?;
        validate_key(key)?;
        ctx.err()?;

        self.backend
            .get_info(ctx, key)
            .await
            .map_err(|e| e.context("failed to get key info"))
    }

    /// Whether `tokens` could be taken right now, without taking them.
    pub async fn is_allowed(&self, ctx: &Context, key: &str, tokens: i64) -> Result<bool> {
        self.validate_tokens(tokens)?;
        let info = self.get_info(ctx, key).await?;
        Ok(info.tokens >= tokens)
    }

    /// Blocks until `tokens` are available for `key` or `ctx` finishes.
    ///
    /// Availability is polled every [`WAIT_POLL_INTERVAL`]; tokens are not consumed.
    /// A request for zero tokens returns immediately.
    pub async fn wait(&self, ctx: &Context, key: &str, tokens: i64) -> Result<()> {
        if tokens == 0 {
            return Ok(());
        }
        self.validate_tokens(tokens)?;

        let mut ticker = tokio::time::interval(WAIT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                err = ctx.done() => {
                    return Err(err.context("context cancelled while waiting"));
                }
                _ = ticker.tick() => {
                    if self.is_allowed(ctx, key, tokens).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Closes the limiter and its backend. Later calls are no-ops.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        info!(target: "tollgate::limiter", "Closing rate limiter");
        self.backend
            .close(ctx)
            .await
            .map_err(|e| e.context("failed to close backend"))
    }

    pub async fn health_check(&self, ctx: &Context) -> Result<()> {
        let closed = self.closed.read().await;
        self.ensure_open(*closed)?;
        ctx.err()?;

        self.backend.health_check(ctx).await
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Copy of the active configuration.
    pub fn config(&self) -> Config {
        self.config.clone()
    }

    fn ensure_open(&self, closed: bool) -> Result<()> {
        if closed {
            return Err(ThrottleError::Unavailable("rate limiter is closed".to_string()));
        }
        Ok(())
    }

    fn validate_tokens(&self, tokens: i64) -> Result<()> {
        if tokens <= 0 {
            return Err(ThrottleError::validation(
                "tokens",
                tokens,
                "tokens must be positive",
            ));
        }

        let ceiling = self.config.max_request_tokens();
        if tokens > ceiling {
            return Err(ThrottleError::validation(
                "tokens",
                tokens,
                format!("tokens exceed reasonable limit ({})", ceiling),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
