use crate::backend::TokenInfo;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Token bucket state for a single key.
///
/// Tokens are minted one per elapsed `refill_interval`. Only whole intervals
/// count: while less than one interval has passed since `last_refill`, the
/// watermark stays where it is and no partial credit accrues.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    tokens: i64,
    max_tokens: i64,
    refill_interval: Duration,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(max_tokens: i64, refill_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_interval,
            last_refill: now,
        }
    }

    /// Rebuilds a bucket from stored fields, clamping `tokens` into `0..=max_tokens`.
    pub fn from_parts(
        tokens: i64,
        max_tokens: i64,
        refill_interval: Duration,
        last_refill: DateTime<Utc>,
    ) -> Self {
        Self {
            tokens: tokens.clamp(0, max_tokens.max(0)),
            max_tokens,
            refill_interval,
            last_refill,
        }
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> i64 {
        self.max_tokens
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn last_refill(&self) -> DateTime<Utc> {
        self.last_refill
    }

    /// Mints tokens for every whole interval elapsed since the watermark.
    /// Returns the number of intervals credited.
    pub fn refill(&mut self, now: DateTime<Utc>) -> i64 {
        if self.refill_interval.is_zero() {
            return 0;
        }

        // A clock that moved backwards counts as no time elapsed.
        let elapsed = (now - self.last_refill).to_std().unwrap_or_default();
        let whole = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if whole == 0 {
            return 0;
        }

        let whole = i64::try_from(whole).unwrap_or(i64::MAX);
        self.tokens = self.tokens.saturating_add(whole).min(self.max_tokens);
        self.last_refill = now;
        whole
    }

    /// Refills, then consumes `requested` tokens if enough are available.
    /// A rejected request leaves the token count untouched.
    pub fn try_consume(&mut self, now: DateTime<Utc>, requested: i64) -> bool {
        self.refill(now);

        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Replaces capacity and rate. Existing tokens are kept, capped at the new capacity.
    pub fn set_limit(&mut self, max_tokens: i64, refill_interval: Duration) {
        self.max_tokens = max_tokens;
        self.refill_interval = refill_interval;
        if self.tokens > max_tokens {
            self.tokens = max_tokens;
        }
    }

    /// True when the bucket has not been refilled since before `cutoff`.
    pub fn is_idle(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_refill < cutoff
    }

    pub fn next_refill(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.refill_interval)
            .ok()
            .and_then(|interval| self.last_refill.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn snapshot(&self, key: &str) -> TokenInfo {
        let next_refill = self.next_refill();
        TokenInfo {
            key: key.to_string(),
            tokens: self.tokens,
            max_tokens: self.max_tokens,
            refill_rate: self.refill_interval,
            last_refill: self.last_refill,
            next_refill,
            reset_time: next_refill,
        }
    }
}
