//! Storage contract shared by the in-memory and Redis backends.

use crate::context::Context;
use crate::error::{Result, ThrottleError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest key, in characters, any backend accepts
pub const MAX_KEY_LENGTH: usize = 256;

/// Storage for per-key token buckets.
///
/// Each call applies the refill/consume arithmetic atomically for its key.
/// Implementations fail with [`ThrottleError::Unavailable`] once closed.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Consumes `tokens` from the bucket for `key`, creating a full bucket on first use.
    /// Returns `false` when not enough tokens are available.
    async fn take(&self, ctx: &Context, key: &str, tokens: i64) -> Result<bool>;

    /// Drops all state for `key`.
    async fn reset(&self, ctx: &Context, key: &str) -> Result<()>;

    /// Snapshot of the bucket after applying any pending refill. Never consumes tokens.
    async fn get_info(&self, ctx: &Context, key: &str) -> Result<TokenInfo>;

    /// Replaces capacity and refill interval for `key`, keeping its current tokens.
    async fn set_limit(&self, ctx: &Context, key: &str, limit: i64, refill: Duration) -> Result<()>;

    /// Stops background work and releases resources. Safe to call more than once.
    async fn close(&self, ctx: &Context) -> Result<()>;

    async fn health_check(&self, ctx: &Context) -> Result<()>;
}

/// Point-in-time view of a key's bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub key: String,
    pub tokens: i64,
    pub max_tokens: i64,
    #[serde(with = "humantime_serde")]
    pub refill_rate: Duration,
    pub last_refill: DateTime<Utc>,
    pub next_refill: DateTime<Utc>,
    pub reset_time: DateTime<Utc>,
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ThrottleError::validation("key", "\"\"", "key cannot be empty"));
    }

    let len = key.chars().count();
    if len > MAX_KEY_LENGTH {
        return Err(ThrottleError::validation(
            "key",
            format!("<{} characters>", len),
            format!("key too long (max {} characters)", MAX_KEY_LENGTH),
        ));
    }

    Ok(())
}

pub(crate) fn validate_tokens(tokens: i64) -> Result<()> {
    if tokens <= 0 {
        return Err(ThrottleError::validation(
            "tokens",
            tokens,
            "tokens must be positive",
        ));
    }
    Ok(())
}

pub(crate) fn validate_limit(limit: i64, refill: Duration) -> Result<()> {
    if limit <= 0 {
        return Err(ThrottleError::validation("limit", limit, "limit must be positive"));
    }
    if refill.is_zero() {
        return Err(ThrottleError::validation(
            "refill",
            format!("{:?}", refill),
            "refill rate must be positive",
        ));
    }
    Ok(())
}
