//! Process-local backend.
//!
//! Buckets live in a [`DashMap`]. Every read-refill-consume runs while holding
//! the write guard of the key's shard, so operations on one key are linearised
//! while keys in other shards proceed in parallel. The idle sweep removes
//! entries through `retain`, which takes the same shard guards.

use crate::backend::{validate_key, validate_limit, validate_tokens, Backend, TokenInfo};
use crate::config::Config;
use crate::context::Context;
use crate::error::{Result, ThrottleError};
use crate::token_bucket::TokenBucket;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct InMemoryBackend {
    buckets: Arc<DashMap<String, TokenBucket>>,
    config: Config,
    closed: AtomicBool,
    shutdown: Context,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryBackend {
    /// Validates `config` and starts the idle sweep. Must be called within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let config = config
            .validated()
            .map_err(|e| e.context("invalid options"))?;

        let buckets = Arc::new(DashMap::new());
        let shutdown = Context::background();
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&buckets),
            config.cleanup_interval,
            config.idle_ttl(),
            shutdown.clone(),
        ));

        info!(
            target: "tollgate::in_memory",
            default_limit = config.default_limit,
            default_refill = ?config.default_refill,
            cleanup_interval = ?config.cleanup_interval,
            "In-memory backend started"
        );

        Ok(Self {
            buckets,
            config,
            closed: AtomicBool::new(false),
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Number of keys currently tracked
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Runs one idle sweep against `now`, returning how many keys were evicted.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        evict_idle(&self.buckets, now, self.config.idle_ttl())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ThrottleError::Unavailable("backend is closed".to_string()));
        }
        Ok(())
    }

    /// Locks the bucket for `key`, creating a full one if absent.
    fn bucket_entry(&self, key: &str, now: DateTime<Utc>) -> Result<RefMut<'_, String, TokenBucket>> {
        // len() touches every shard, so it must run before any shard guard is held.
        if !self.buckets.contains_key(key) && self.buckets.len() >= self.config.max_keys {
            return Err(ThrottleError::KeyLimitReached {
                max_keys: self.config.max_keys,
            });
        }

        Ok(self.buckets.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(self.config.default_limit, self.config.default_refill, now)
        }))
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn take(&self, ctx: &Context, key: &str, tokens: i64) -> Result<bool> {
        self.ensure_open()?;
        validate_key(key)?;
        validate_tokens(tokens)?;
        ctx.err()?;

        let now = Utc::now();
        let mut bucket = self.bucket_entry(key, now)?;
        let allowed = bucket.try_consume(now, tokens);

        debug!(
            target: "tollgate::in_memory",
            key,
            tokens,
            remaining = bucket.tokens(),
            allowed,
            "take"
        );
        Ok(allowed)
    }

    async fn reset(&self, ctx: &Context, key: &str) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        ctx.err()?;

        self.buckets.remove(key);
        debug!(target: "tollgate::in_memory", key, "reset");
        Ok(())
    }

    async fn get_info(&self, ctx: &Context, key: &str) -> Result<TokenInfo> {
        self.ensure_open()?;
        validate_key(key)?;
        ctx.err()?;

        let now = Utc::now();
        let mut bucket = self.bucket_entry(key, now)?;
        bucket.refill(now);
        Ok(bucket.snapshot(key))
    }

    async fn set_limit(&self, ctx: &Context, key: &str, limit: i64, refill: Duration) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;
        validate_limit(limit, refill)?;
        ctx.err()?;

        let now = Utc::now();
        let mut bucket = self.bucket_entry(key, now)?;
        bucket.set_limit(limit, refill);

        debug!(target: "tollgate::in_memory", key, limit, refill = ?refill, "set_limit");
        Ok(())
    }

    async fn close(&self, _ctx: &Context) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            // The sweep loop only exits on shutdown; a join error means it panicked.
            if let Err(e) = handle.await {
                tracing::warn!(target: "tollgate::in_memory", error = %e, "Sweep task ended abnormally");
            }
        }

        info!(target: "tollgate::in_memory", keys = self.buckets.len(), "In-memory backend closed");
        Ok(())
    }

    async fn health_check(&self, ctx: &Context) -> Result<()> {
        self.ensure_open()?;
        ctx.err()?;
        Ok(())
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        // Stops the sweep task so it releases the bucket map.
        self.shutdown.cancel();
    }
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("keys", &self.buckets.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish()
    }
}

async fn sweep_loop(
    buckets: Arc<DashMap<String, TokenBucket>>,
    every: Duration,
    idle_ttl: Duration,
    shutdown: Context,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.done() => break,
            _ = ticker.tick() => {
                let evicted = evict_idle(&buckets, Utc::now(), idle_ttl);
                if evicted > 0 {
                    debug!(target: "tollgate::in_memory", evicted, remaining = buckets.len(), "Evicted idle buckets");
                }
            }
        }
    }
}

fn evict_idle(buckets: &DashMap<String, TokenBucket>, now: DateTime<Utc>, idle_ttl: Duration) -> usize {
    let Some(cutoff) = chrono::Duration::from_std(idle_ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
    else {
        return 0;
    };

    let mut evicted = 0;
    buckets.retain(|_, bucket| {
        let idle = bucket.is_idle(cutoff);
        if idle {
            evicted += 1;
        }
        !idle
    });
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(limit: i64, refill: Duration) -> InMemoryBackend {
        let config = Config::default().with_defaults(limit, refill, 1);
        InMemoryBackend::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_options() {
        let err = InMemoryBackend::new(Config::default().with_limit(0)).unwrap_err();
        assert!(err.is_validation());

        let err = InMemoryBackend::new(Config::default().with_cleanup(Duration::ZERO, 10)).unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_take_exhausts_bucket() {
        let backend = backend(5, Duration::from_secs(60));
        let ctx = Context::background();

        for _ in 0..5 {
            assert!(backend.take(&ctx, "user_123", 1).await.unwrap());
        }
        assert!(!backend.take(&ctx, "user_123", 1).await.unwrap());

        // Other keys are independent.
        assert!(backend.take(&ctx, "user_456", 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_take_validates_input() {
        let backend = backend(5, Duration::from_secs(1));
        let ctx = Context::background();

        assert!(backend.take(&ctx, "", 1).await.unwrap_err().is_validation());
        assert!(backend.take(&ctx, "k", 0).await.unwrap_err().is_validation());
        assert!(backend.take(&ctx, "k", -1).await.unwrap_err().is_validation());
        assert!(backend
            .take(&ctx, &"k".repeat(257), 1)
            .await
            .unwrap_err()
            .is_validation());
        assert_eq!(backend.key_count(), 0);
    }

    #[tokio::test]
    async fn test_take_respects_cancelled_context() {
        let backend = backend(5, Duration::from_secs(1));
        let ctx = Context::background();
        ctx.cancel();

        assert!(backend.take(&ctx, "k", 1).await.unwrap_err().is_cancelled());
        assert_eq!(backend.key_count(), 0);
    }

    #[tokio::test]
    async fn test_refill_after_interval() {
        let backend = backend(2, Duration::from_millis(100));
        let ctx = Context::background();

        assert!(backend.take(&ctx, "k", 2).await.unwrap());
        assert!(!backend.take(&ctx, "k", 1).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.take(&ctx, "k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_recreates_full_bucket() {
        let backend = backend(3, Duration::from_secs(60));
        let ctx = Context::background();

        assert!(backend.take(&ctx, "k", 3).await.unwrap());
        backend.reset(&ctx, "k").await.unwrap();
        assert_eq!(backend.key_count(), 0);

        let info = backend.get_info(&ctx, "k").await.unwrap();
        assert_eq!(info.tokens, 3);
    }

    #[tokio::test]
    async fn test_get_info_does_not_consume() {
        let backend = backend(4, Duration::from_secs(60));
        let ctx = Context::background();

        assert!(backend.take(&ctx, "k", 1).await.unwrap());
        for _ in 0..3 {
            let info = backend.get_info(&ctx, "k").await.unwrap();
            assert_eq!(info.key, "k");
            assert_eq!(info.tokens, 3);
            assert_eq!(info.max_tokens, 4);
            assert_eq!(info.refill_rate, Duration::from_secs(60));
            assert!(info.next_refill > info.last_refill);
        }
    }

    #[tokio::test]
    async fn test_set_limit_preserves_tokens() {
        let backend = backend(10, Duration::from_secs(60));
        let ctx = Context::background();

        assert!(backend.take(&ctx, "k", 4).await.unwrap());
        backend.set_limit(&ctx, "k", 20, Duration::from_secs(2)).await.unwrap();

        let info = backend.get_info(&ctx, "k").await.unwrap();
        assert_eq!(info.tokens, 6);
        assert_eq!(info.max_tokens, 20);
        assert_eq!(info.refill_rate, Duration::from_secs(2));

        backend.set_limit(&ctx, "k", 2, Duration::from_secs(2)).await.unwrap();
        let info = backend.get_info(&ctx, "k").await.unwrap();
        assert_eq!(info.tokens, 2);
        assert_eq!(info.max_tokens, 2);
    }

    #[tokio::test]
    async fn test_set_limit_rejects_non_positive() {
        let backend = backend(10, Duration::from_secs(1));
        let ctx = Context::background();

        assert!(backend
            .set_limit(&ctx, "k", 0, Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_validation());
        assert!(backend
            .set_limit(&ctx, "k", 5, Duration::ZERO)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = backend(5, Duration::from_secs(1));
        let ctx = Context::background();

        backend.close(&ctx).await.unwrap();
        backend.close(&ctx).await.unwrap();

        assert!(backend.take(&ctx, "k", 1).await.unwrap_err().is_unavailable());
        assert!(backend.reset(&ctx, "k").await.unwrap_err().is_unavailable());
        assert!(backend.get_info(&ctx, "k").await.unwrap_err().is_unavailable());
        assert!(backend
            .set_limit(&ctx, "k", 1, Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_unavailable());
        assert!(backend.health_check(&ctx).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_health_check() {
        let backend = backend(5, Duration::from_secs(1));
        assert!(backend.health_check(&Context::background()).await.is_ok());

        let cancelled = Context::background();
        cancelled.cancel();
        assert!(backend.health_check(&cancelled).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_max_keys_is_enforced_for_new_keys() {
        let config = Config::default().with_cleanup(Duration::from_secs(60), 2);
        let backend = InMemoryBackend::new(config).unwrap();
        let ctx = Context::background();

        assert!(backend.take(&ctx, "a", 1).await.unwrap());
        assert!(backend.take(&ctx, "b", 1).await.unwrap());

        let err = backend.take(&ctx, "c", 1).await.unwrap_err();
        assert!(matches!(err, ThrottleError::KeyLimitReached { max_keys: 2 }));

        // Existing keys keep working.
        assert!(backend.take(&ctx, "a", 1).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_take_never_over_admits() {
        let backend = Arc::new(backend(100, Duration::from_secs(3600)));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                backend.take(&Context::background(), "shared", 10).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        let info = backend.get_info(&Context::background(), "shared").await.unwrap();
        assert_eq!(info.tokens, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_uses_twice_cleanup_interval() {
        let config = Config::default().with_cleanup(Duration::from_secs(10), 100);
        let backend = InMemoryBackend::new(config).unwrap();
        let ctx = Context::background();

        assert!(backend.take(&ctx, "k", 1).await.unwrap());
        let now = Utc::now();

        assert_eq!(backend.evict_idle(now + chrono::Duration::seconds(15)), 0);
        assert_eq!(backend.key_count(), 1);

        assert_eq!(backend.evict_idle(now + chrono::Duration::seconds(25)), 1);
        assert_eq!(backend.key_count(), 0);
    }

    #[tokio::test]
    async fn test_background_sweep_evicts_idle_keys() {
        let config = Config::default()
            .with_defaults(5, Duration::from_secs(3600), 1)
            .with_cleanup(Duration::from_millis(50), 100);
        let backend = InMemoryBackend::new(config).unwrap();
        let ctx = Context::background();

        assert!(backend.take(&ctx, "k", 1).await.unwrap());
        assert_eq!(backend.key_count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(backend.key_count(), 0);

        backend.close(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_stops_sweep_task() {
        let config = Config::default().with_cleanup(Duration::from_millis(20), 100);
        let backend = InMemoryBackend::new(config).unwrap();
        let buckets = Arc::clone(&backend.buckets);
        assert_eq!(Arc::strong_count(&buckets), 3);

        drop(backend);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(Arc::strong_count(&buckets), 1);
    }
}
